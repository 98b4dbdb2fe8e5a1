//! The copy engine: walks candidate replicas for a hash, retries with
//! back-off, and verifies every byte that lands on disk before handing it to
//! the caller's continuation.
//!
//! This is the busiest module in the crate. The admission gate
//! ([`crate::scheduler`]) and the keyed mutex ([`crate::single_flight`]) are
//! both consumed here but owned by the session layer — the engine itself only
//! ever sees one request at a time and knows nothing about coalescing.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use rand::Rng;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::{BandwidthConfiguration, BandwidthSelector, EngineConfig};
use crate::error::CopyError;
use crate::hash::{ContentHash, ContentHashWithSize, MachineLocation, SizeHint};
use crate::hasher::{HasherFactory, IncrementalHasher};
use crate::host::{CopyResultReporter, Reputation};
use crate::scheduler::{CopyScheduler, Direction};

/// Outcome of a single replica copy attempt, named after the failure classes
/// a remote copier can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyFileResultCode {
    Success,
    FileNotFoundError,
    ServerUnavailable,
    UnknownServerError,
    RpcError,
    Unknown,
    ConnectionTimeoutError,
    TimeToFirstByteTimeoutError,
    CopyTimeoutError,
    CopyBandwidthTimeoutError,
    DestinationPathError,
    InvalidHash,
}

impl CopyFileResultCode {
    fn is_missing(self) -> bool {
        matches!(self, CopyFileResultCode::FileNotFoundError)
    }

    fn is_timeout(self) -> bool {
        matches!(
            self,
            CopyFileResultCode::ConnectionTimeoutError
                | CopyFileResultCode::TimeToFirstByteTimeoutError
                | CopyFileResultCode::CopyTimeoutError
                | CopyFileResultCode::CopyBandwidthTimeoutError
        )
    }
}

/// What a [`RemoteFileCopier`] reports back about one attempt.
#[derive(Clone, Debug)]
pub struct CopyFileResult {
    pub code: CopyFileResultCode,
    pub bytes_copied: u64,
    /// Diagnostic text for non-`Success` codes; the out-of-disk predicate for
    /// `DestinationPathError` sniffs this for an out-of-space condition.
    pub message: Option<String>,
}

impl CopyFileResult {
    pub fn success(bytes_copied: u64) -> Self {
        Self {
            code: CopyFileResultCode::Success,
            bytes_copied,
            message: None,
        }
    }
}

/// Per-attempt copy parameters derived from the bandwidth table.
#[derive(Clone, Debug)]
pub struct CopyOptions {
    pub bandwidth: BandwidthConfiguration,
    pub expected_size: SizeHint,
}

/// The external collaborator that actually moves bytes from a peer or the
/// backing store into a local destination. This crate only consumes it.
#[async_trait::async_trait]
pub trait RemoteFileCopier: Send + Sync {
    async fn copy_file(
        &self,
        location: &MachineLocation,
        hash_info: &ContentHashWithSize,
        destination: &mut (dyn AsyncWrite + Unpin + Send),
        options: &CopyOptions,
        cancel: &CancellationToken,
    ) -> Result<CopyFileResult, CopyError>;
}

/// Diagnostics about a single attempt, reported to the host's reputation sink.
#[derive(Clone, Debug)]
pub struct CopyAttemptInfo {
    pub location: MachineLocation,
    pub outer_attempt: usize,
    pub from_ring: bool,
}

/// Invoked once a replica's bytes have landed in a verified temp file.
/// May be invoked more than once across outer retry passes if the handler
/// itself signals failure (e.g. the local store rejected the put).
pub type HandleCopy =
    Arc<dyn Fn(PathBuf, ContentHashWithSize) -> BoxFuture<'static, Result<(), CopyError>> + Send + Sync>;

/// A request to fetch content from one of several candidate locations.
pub struct CopyRequest {
    pub hash_info: ContentHashWithSize,
    pub candidates: Vec<MachineLocation>,
    /// Locations known to be in this machine's replication ring but not
    /// necessarily already present in `candidates`; appended to the walked
    /// candidate list by [`all_location_candidates`] and tagged `FromRing`.
    pub ring_members: Vec<MachineLocation>,
    pub handle_copy: HandleCopy,
}

/// `GetAllLocationCandidates()`: `candidates` followed by any `ring_members`
/// not already present, so a ring member the resolver didn't itself report
/// still gets attempted.
fn all_location_candidates(request: &CopyRequest) -> Vec<MachineLocation> {
    let mut all = request.candidates.clone();
    for member in &request.ring_members {
        if !all.contains(member) {
            all.push(member.clone());
        }
    }
    all
}

/// Per-request replica bookkeeping. Persists across outer retry passes (it is
/// constructed once per [`CopyEngine::try_copy_and_put`] call) so a replica
/// marked missing on pass 1 stays skipped on pass 2 instead of being retried
/// from scratch.
#[derive(Default)]
struct ReplicaTracker {
    missing: std::collections::HashSet<MachineLocation>,
    bad: std::collections::HashMap<MachineLocation, u32>,
    timed_out: std::collections::HashMap<MachineLocation, u32>,
    last_failure_time: std::collections::HashMap<MachineLocation, tokio::time::Instant>,
}

impl ReplicaTracker {
    fn should_skip(&self, location: &MachineLocation) -> bool {
        self.missing.contains(location)
    }

    fn mark_missing(&mut self, location: &MachineLocation) {
        self.missing.insert(location.clone());
    }

    fn mark_bad(&mut self, location: &MachineLocation) {
        *self.bad.entry(location.clone()).or_insert(0) += 1;
        self.last_failure_time.insert(location.clone(), tokio::time::Instant::now());
    }

    fn mark_timeout(&mut self, location: &MachineLocation) {
        *self.timed_out.entry(location.clone()).or_insert(0) += 1;
        self.last_failure_time.insert(location.clone(), tokio::time::Instant::now());
    }

    /// How much longer to hold off on a replica that has previously failed,
    /// scaled by how many times it has failed so the engine backs off harder
    /// on a replica that keeps misbehaving.
    fn remaining_delay(&self, location: &MachineLocation, base: Duration) -> Duration {
        let failures = self.bad.get(location).copied().unwrap_or(0) + self.timed_out.get(location).copied().unwrap_or(0);
        if failures == 0 {
            return Duration::ZERO;
        }
        let Some(&last) = self.last_failure_time.get(location) else {
            return Duration::ZERO;
        };
        let due = base.saturating_mul(failures.min(8));
        let elapsed = last.elapsed();
        due.saturating_sub(elapsed)
    }
}

/// Dispatches hashing work either inline on the copy task or on a background
/// blocking thread, matching the design's parallel-hashing size boundary.
enum HasherSink {
    Inline(Option<Box<dyn IncrementalHasher>>),
    Concurrent {
        tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
        result: oneshot::Receiver<ContentHash>,
    },
}

impl HasherSink {
    fn inline(hasher: Box<dyn IncrementalHasher>) -> Self {
        HasherSink::Inline(Some(hasher))
    }

    fn concurrent(mut hasher: Box<dyn IncrementalHasher>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (result_tx, result_rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            while let Some(chunk) = rx.blocking_recv() {
                hasher.update(&chunk);
            }
            let _ = result_tx.send(hasher.finish());
        });
        HasherSink::Concurrent {
            tx: Some(tx),
            result: result_rx,
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        match self {
            HasherSink::Inline(hasher) => {
                hasher.as_mut().expect("fed after finish").update(bytes);
            }
            HasherSink::Concurrent { tx, .. } => {
                if let Some(tx) = tx.as_ref() {
                    let _ = tx.send(bytes.to_vec());
                }
            }
        }
    }

    async fn finish(mut self) -> ContentHash {
        match &mut self {
            HasherSink::Inline(hasher) => hasher.take().expect("finish called once").finish(),
            HasherSink::Concurrent { tx, result } => {
                tx.take();
                result.await.expect("hashing task never panics")
            }
        }
    }
}

/// Wraps a destination writer so every byte written also flows into a
/// [`HasherSink`], producing the content's hash without a second disk pass.
struct HashingWriter<W> {
    inner: W,
    sink: HasherSink,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for HashingWriter<W> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                self.sink.feed(&buf[..n]);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Drives replica selection, retry back-off, and hash verification for a
/// single logical "get this content" request.
pub struct CopyEngine {
    scheduler: Arc<CopyScheduler>,
    config: EngineConfig,
    bandwidth: BandwidthSelector,
    hasher_factory: Arc<dyn HasherFactory>,
    copier: Arc<dyn RemoteFileCopier>,
    reporter: Arc<dyn CopyResultReporter>,
}

impl CopyEngine {
    pub fn new(
        scheduler: Arc<CopyScheduler>,
        config: EngineConfig,
        hasher_factory: Arc<dyn HasherFactory>,
        copier: Arc<dyn RemoteFileCopier>,
        reporter: Arc<dyn CopyResultReporter>,
    ) -> Self {
        Self {
            scheduler,
            config,
            bandwidth: BandwidthSelector::default_table(),
            hasher_factory,
            copier,
            reporter,
        }
    }

    /// Walks `request.candidates` concatenated with any `request.ring_members`
    /// not already present, retrying across outer passes governed by
    /// `retry_intervals`, until content is verified and handed to
    /// `request.handle_copy`, or the retry budget is exhausted.
    pub async fn try_copy_and_put(
        &self,
        request: CopyRequest,
        cancel: &CancellationToken,
    ) -> Result<ContentHashWithSize, CopyError> {
        let mut tracker = ReplicaTracker::default();
        let mut total_retries: u32 = 0;
        let outer_passes = self.config.retry_intervals.len() + 1;
        let all_candidates = all_location_candidates(&request);

        for outer_attempt in 0..outer_passes {
            if cancel.is_cancelled() {
                return Err(CopyError::Cancelled);
            }

            if outer_attempt > 0 {
                let interval = self.config.retry_intervals[outer_attempt - 1];
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    () = cancel.cancelled() => return Err(CopyError::Cancelled),
                }
            }

            let max_replicas = self.config.max_replica_count(outer_attempt, all_candidates.len());
            let candidates = &all_candidates[..max_replicas.min(all_candidates.len())];

            match self
                .walk_locations_and_copy_and_put(&request, candidates, outer_attempt, &mut tracker, &mut total_retries, cancel)
                .await
            {
                WalkOutcome::Success(result) => return Ok(result),
                WalkOutcome::ExhaustedCandidates => {}
                WalkOutcome::Terminal(e) => return Err(e),
            }

            if total_retries >= self.config.max_retry_count {
                return Err(CopyError::MaxRetries { attempts: total_retries });
            }
        }

        Err(CopyError::NotFound {
            hash: request.hash_info.hash,
            detail: "no candidate location produced a verified copy".to_string(),
        })
    }

    async fn walk_locations_and_copy_and_put(
        &self,
        request: &CopyRequest,
        candidates: &[MachineLocation],
        outer_attempt: usize,
        tracker: &mut ReplicaTracker,
        total_retries: &mut u32,
        cancel: &CancellationToken,
    ) -> WalkOutcome {
        let base_delay = self
            .config
            .retry_intervals
            .first()
            .copied()
            .unwrap_or(Duration::from_millis(20));

        for location in candidates {
            if tracker.should_skip(location) {
                continue;
            }
            if *total_retries >= self.config.max_retry_count {
                return WalkOutcome::ExhaustedCandidates;
            }

            let remaining = tracker.remaining_delay(location, base_delay);
            if !remaining.is_zero() {
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let wait = remaining.mul_f64(jitter);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    () = cancel.cancelled() => return WalkOutcome::Terminal(CopyError::Cancelled),
                }
            }

            *total_retries += 1;
            let from_ring = request.ring_members.contains(location);
            match self
                .copy_one_replica(request, location, outer_attempt, from_ring, cancel)
                .await
            {
                Ok(result) => return WalkOutcome::Success(result),
                Err(ReplicaOutcome::Missing) => {
                    tracker.mark_missing(location);
                    self.reporter.report_copy_result(location, Reputation::Missing, from_ring).await;
                }
                Err(ReplicaOutcome::Bad) => {
                    tracker.mark_bad(location);
                    self.reporter.report_copy_result(location, Reputation::Bad, from_ring).await;
                }
                Err(ReplicaOutcome::Timeout) => {
                    tracker.mark_timeout(location);
                    self.reporter.report_copy_result(location, Reputation::Timeout, from_ring).await;
                }
                // §4.4: no tracker state, no reputation report — just the next candidate.
                Err(ReplicaOutcome::InvalidHash) => {}
                Err(ReplicaOutcome::Terminal(e)) => return WalkOutcome::Terminal(e),
            }
        }

        WalkOutcome::ExhaustedCandidates
    }

    async fn copy_one_replica(
        &self,
        request: &CopyRequest,
        location: &MachineLocation,
        outer_attempt: usize,
        from_ring: bool,
        cancel: &CancellationToken,
    ) -> Result<ContentHashWithSize, ReplicaOutcome> {
        let temp = tempfile::NamedTempFile::new_in(&self.config.workspace)
            .map_err(|e| ReplicaOutcome::Terminal(CopyError::DestinationError { detail: e.to_string() }))?;
        let temp_path = temp.path().to_path_buf();

        let result = {
            let scheduler = self.scheduler.clone();
            let copier = self.copier.clone();
            let hash_info = request.hash_info.clone();
            let location = location.clone();
            let bandwidth = self.bandwidth.select(outer_attempt, outer_attempt as u32, self.config.max_retry_count);
            let options = CopyOptions {
                bandwidth,
                expected_size: hash_info.size,
            };
            let use_trusted = self.config.use_trusted_hash(hash_info.size.known());
            let use_parallel = hash_info
                .size
                .known()
                .map(|s| self.config.use_parallel_hashing(s))
                .unwrap_or(false);
            let hasher_factory = self.hasher_factory.clone();
            let cancel = cancel.clone();
            let temp_path_for_write = temp_path.clone();

            self.scheduler_run(scheduler, temp_path.clone(), move || async move {
                let file = tokio::fs::File::create(&temp_path_for_write).await.map_err(|e| {
                    CopyError::DestinationError { detail: e.to_string() }
                })?;

                if use_trusted {
                    let hasher = hasher_factory.start(hash_info.hash.hash_type());
                    let sink = if use_parallel {
                        HasherSink::concurrent(hasher)
                    } else {
                        HasherSink::inline(hasher)
                    };
                    let mut writer = HashingWriter { inner: file, sink };
                    let copy_result = copier
                        .copy_file(&location, &hash_info, &mut writer, &options, &cancel)
                        .await?;
                    writer.inner.flush().await.map_err(|e| CopyError::DestinationError { detail: e.to_string() })?;
                    let computed_hash = writer.sink.finish().await;
                    Ok((copy_result, Some(computed_hash)))
                } else {
                    let mut file = file;
                    let copy_result = copier
                        .copy_file(&location, &hash_info, &mut file, &options, &cancel)
                        .await?;
                    file.flush().await.map_err(|e| CopyError::DestinationError { detail: e.to_string() })?;
                    Ok((copy_result, None))
                }
            })
            .await
        };

        let inner = match result {
            Ok(inner) => inner,
            Err(e) => return Err(classify_schedule_error(e)),
        };
        let (copy_result, computed_hash) = match inner {
            Ok(v) => v,
            Err(copy_err) => {
                return Err(match copy_err {
                    CopyError::SourceMissing { .. } => ReplicaOutcome::Missing,
                    CopyError::Cancelled => ReplicaOutcome::Terminal(copy_err),
                    _ => ReplicaOutcome::Bad,
                });
            }
        };

        match classify(&copy_result) {
            Classification::Missing => return Err(ReplicaOutcome::Missing),
            Classification::Bad => return Err(ReplicaOutcome::Bad),
            Classification::Timeout => return Err(ReplicaOutcome::Timeout),
            // §4.4: tried next replica, no reputation change.
            Classification::InvalidHash => return Err(ReplicaOutcome::InvalidHash),
            // §4.4/§8 scenario 6: stop immediately, no further replicas.
            Classification::Destination(e) => return Err(ReplicaOutcome::Terminal(e)),
            Classification::Success => {}
        }

        if let SizeHint::Known(expected) = request.hash_info.size {
            if copy_result.bytes_copied != expected {
                return Err(ReplicaOutcome::Bad);
            }
        }

        if let Some(computed) = computed_hash {
            if computed != request.hash_info.hash {
                // §4.4/§10.5: InvalidHash from a trusted-hash mismatch carries
                // no reputation change either, matching a peer-reported one.
                return Err(ReplicaOutcome::InvalidHash);
            }
        }

        let verified = ContentHashWithSize::new(request.hash_info.hash, SizeHint::Known(copy_result.bytes_copied));
        let handled = (request.handle_copy)(temp_path.clone(), verified.clone()).await;
        let _ = tokio::fs::remove_file(&temp_path).await;

        match handled {
            Ok(()) => {
                self.reporter.report_copy_result(location, Reputation::Good, from_ring).await;
                Ok(verified)
            }
            Err(e) if e.is_terminal() => Err(ReplicaOutcome::Terminal(e)),
            Err(_) => Err(ReplicaOutcome::Bad),
        }
    }

    async fn scheduler_run<F, Fut, T>(
        &self,
        scheduler: Arc<CopyScheduler>,
        temp_path: PathBuf,
        op: F,
    ) -> Result<T, crate::error::SchedulerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send,
        T: Send + 'static,
    {
        let _ = &temp_path;
        let (value, _summary) = scheduler.schedule(Direction::Pull, "copy", 0, op).await?;
        Ok(value)
    }
}

fn classify_schedule_error(_e: crate::error::SchedulerError) -> ReplicaOutcome {
    ReplicaOutcome::Timeout
}

enum Classification {
    Success,
    Missing,
    Bad,
    Timeout,
    /// Peer or local hash verification failed; try the next replica, but
    /// unlike `Bad`, the source's reputation is left untouched (§4.4).
    InvalidHash,
    /// `DestinationPathError`; stop the whole request rather than trying
    /// another replica (§4.4, §8 scenario 6).
    Destination(CopyError),
}

/// An out-of-space `DestinationPathError` disables retries exactly like any
/// other destination error, but is reported as `DestinationFull` rather than
/// `DestinationError` so callers can distinguish the two (§4.4's "Out-of-disk
/// detection" paragraph).
fn is_out_of_disk(message: Option<&str>) -> bool {
    message
        .map(|m| m.to_ascii_lowercase())
        .map(|m| m.contains("no space") || m.contains("disk full") || m.contains("out of space") || m.contains("enospc"))
        .unwrap_or(false)
}

fn classify(result: &CopyFileResult) -> Classification {
    match result.code {
        CopyFileResultCode::Success => Classification::Success,
        CopyFileResultCode::InvalidHash => Classification::InvalidHash,
        CopyFileResultCode::DestinationPathError => {
            let detail = result.message.clone().unwrap_or_default();
            if is_out_of_disk(result.message.as_deref()) {
                Classification::Destination(CopyError::DestinationFull { detail })
            } else {
                Classification::Destination(CopyError::DestinationError { detail })
            }
        }
        code if code.is_missing() => Classification::Missing,
        code if code.is_timeout() => Classification::Timeout,
        _ => Classification::Bad,
    }
}

enum ReplicaOutcome {
    Missing,
    Bad,
    Timeout,
    /// Hash verification failed; move on without touching reputation.
    InvalidHash,
    Terminal(CopyError),
}

enum WalkOutcome {
    Success(ContentHashWithSize),
    ExhaustedCandidates,
    Terminal(CopyError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::test_support::FnvHasherFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedCopier {
        results: Mutex<std::collections::VecDeque<(CopyFileResultCode, Vec<u8>)>>,
    }

    #[async_trait::async_trait]
    impl RemoteFileCopier for ScriptedCopier {
        async fn copy_file(
            &self,
            _location: &MachineLocation,
            _hash_info: &ContentHashWithSize,
            destination: &mut (dyn AsyncWrite + Unpin + Send),
            _options: &CopyOptions,
            _cancel: &CancellationToken,
        ) -> Result<CopyFileResult, CopyError> {
            let (code, payload) = self
                .results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((CopyFileResultCode::FileNotFoundError, Vec::new()));
            if code == CopyFileResultCode::Success {
                destination
                    .write_all(&payload)
                    .await
                    .map_err(|e| CopyError::DestinationError { detail: e.to_string() })?;
            }
            Ok(CopyFileResult {
                code,
                bytes_copied: payload.len() as u64,
                message: None,
            })
        }
    }

    struct NoopReporter;
    #[async_trait::async_trait]
    impl CopyResultReporter for NoopReporter {
        async fn report_copy_result(&self, _location: &MachineLocation, _reputation: Reputation, _from_ring: bool) {}
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            retry_intervals: vec![Duration::from_millis(1), Duration::from_millis(1)],
            workspace: std::env::temp_dir(),
            ..EngineConfig::default()
        }
    }

    fn hash_for(payload: &[u8]) -> ContentHash {
        use crate::hasher::HasherFactory;
        FnvHasherFactory.digest(crate::hash::HashType::Sha256, payload)
    }

    #[tokio::test]
    async fn succeeds_on_first_good_replica() {
        let payload = b"hello ephemeral cache".to_vec();
        let hash = hash_for(&payload);
        let copier = Arc::new(ScriptedCopier {
            results: Mutex::new(std::collections::VecDeque::from([(CopyFileResultCode::Success, payload.clone())])),
        });
        let engine = CopyEngine::new(
            Arc::new(CopyScheduler::new(Default::default())),
            test_config(),
            Arc::new(FnvHasherFactory),
            copier,
            Arc::new(NoopReporter),
        );

        let handled_count = Arc::new(AtomicUsize::new(0));
        let handled_count2 = handled_count.clone();
        let handle_copy: HandleCopy = Arc::new(move |_path, _info| {
            handled_count2.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        });

        let request = CopyRequest {
            hash_info: ContentHashWithSize::new(hash, SizeHint::Known(payload.len() as u64)),
            candidates: vec![MachineLocation("peer-a".into())],
            ring_members: vec![],
            handle_copy,
        };

        let cancel = CancellationToken::new();
        let result = engine.try_copy_and_put(request, &cancel).await.unwrap();
        assert_eq!(result.size, SizeHint::Known(payload.len() as u64));
        assert_eq!(handled_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn falls_through_to_second_replica_after_missing() {
        let payload = b"second replica wins".to_vec();
        let hash = hash_for(&payload);
        let copier = Arc::new(ScriptedCopier {
            results: Mutex::new(std::collections::VecDeque::from([
                (CopyFileResultCode::FileNotFoundError, Vec::new()),
                (CopyFileResultCode::Success, payload.clone()),
            ])),
        });
        let engine = CopyEngine::new(
            Arc::new(CopyScheduler::new(Default::default())),
            test_config(),
            Arc::new(FnvHasherFactory),
            copier,
            Arc::new(NoopReporter),
        );

        let handle_copy: HandleCopy = Arc::new(move |_path, _info| Box::pin(async { Ok(()) }));
        let request = CopyRequest {
            hash_info: ContentHashWithSize::new(hash, SizeHint::Known(payload.len() as u64)),
            candidates: vec![MachineLocation("peer-a".into()), MachineLocation("peer-b".into())],
            ring_members: vec![],
            handle_copy,
        };

        let cancel = CancellationToken::new();
        let result = engine.try_copy_and_put(request, &cancel).await.unwrap();
        assert_eq!(result.size, SizeHint::Known(payload.len() as u64));
    }

    #[tokio::test]
    async fn hash_mismatch_is_treated_as_bad_replica_not_success() {
        let payload = b"tampered".to_vec();
        let wrong_hash = hash_for(b"not tampered");
        let copier = Arc::new(ScriptedCopier {
            results: Mutex::new(std::collections::VecDeque::from([(CopyFileResultCode::Success, payload.clone())])),
        });
        let engine = CopyEngine::new(
            Arc::new(CopyScheduler::new(Default::default())),
            EngineConfig {
                retry_intervals: vec![],
                workspace: std::env::temp_dir(),
                ..EngineConfig::default()
            },
            Arc::new(FnvHasherFactory),
            copier,
            Arc::new(NoopReporter),
        );

        let handle_copy: HandleCopy = Arc::new(move |_path, _info| Box::pin(async { Ok(()) }));
        let request = CopyRequest {
            hash_info: ContentHashWithSize::new(wrong_hash, SizeHint::Known(payload.len() as u64)),
            candidates: vec![MachineLocation("peer-a".into())],
            ring_members: vec![],
            handle_copy,
        };

        let cancel = CancellationToken::new();
        let result = engine.try_copy_and_put(request, &cancel).await;
        assert!(result.is_err());
    }

    struct RecordingReporter {
        calls: Mutex<Vec<(MachineLocation, Reputation, bool)>>,
    }

    #[async_trait::async_trait]
    impl CopyResultReporter for RecordingReporter {
        async fn report_copy_result(&self, location: &MachineLocation, reputation: Reputation, from_ring: bool) {
            self.calls.lock().unwrap().push((location.clone(), reputation, from_ring));
        }
    }

    #[tokio::test]
    async fn ring_member_not_in_candidates_is_still_attempted_and_tagged() {
        let payload = b"only reachable via the ring".to_vec();
        let hash = hash_for(&payload);
        let copier = Arc::new(ScriptedCopier {
            results: Mutex::new(std::collections::VecDeque::from([(CopyFileResultCode::Success, payload.clone())])),
        });
        let reporter = Arc::new(RecordingReporter { calls: Mutex::new(Vec::new()) });
        let engine = CopyEngine::new(
            Arc::new(CopyScheduler::new(Default::default())),
            test_config(),
            Arc::new(FnvHasherFactory),
            copier,
            reporter.clone(),
        );

        let handle_copy: HandleCopy = Arc::new(move |_path, _info| Box::pin(async { Ok(()) }));
        let ring_peer = MachineLocation("ring-only-peer".into());
        let request = CopyRequest {
            hash_info: ContentHashWithSize::new(hash, SizeHint::Known(payload.len() as u64)),
            candidates: vec![],
            ring_members: vec![ring_peer.clone()],
            handle_copy,
        };

        let cancel = CancellationToken::new();
        let result = engine.try_copy_and_put(request, &cancel).await.unwrap();
        assert_eq!(result.size, SizeHint::Known(payload.len() as u64));

        let calls = reporter.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, ring_peer);
        assert!(calls[0].2, "ring-only candidate must be tagged from_ring");
    }

    struct CountingFixedResultCopier {
        result: CopyFileResult,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RemoteFileCopier for CountingFixedResultCopier {
        async fn copy_file(
            &self,
            _location: &MachineLocation,
            _hash_info: &ContentHashWithSize,
            _destination: &mut (dyn AsyncWrite + Unpin + Send),
            _options: &CopyOptions,
            _cancel: &CancellationToken,
        ) -> Result<CopyFileResult, CopyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result.clone())
        }
    }

    #[tokio::test]
    async fn out_of_disk_destination_error_stops_without_trying_next_replica() {
        let copier = Arc::new(CountingFixedResultCopier {
            result: CopyFileResult {
                code: CopyFileResultCode::DestinationPathError,
                bytes_copied: 0,
                message: Some("write failed: ENOSPC: no space left on device".into()),
            },
            calls: AtomicUsize::new(0),
        });
        let engine = CopyEngine::new(
            Arc::new(CopyScheduler::new(Default::default())),
            test_config(),
            Arc::new(FnvHasherFactory),
            copier.clone(),
            Arc::new(NoopReporter),
        );

        let handle_copy: HandleCopy = Arc::new(move |_path, _info| Box::pin(async { Ok(()) }));
        let request = CopyRequest {
            hash_info: ContentHashWithSize::new(hash_for(b"disk full"), SizeHint::Known(1)),
            candidates: vec![MachineLocation("peer-a".into()), MachineLocation("peer-b".into())],
            ring_members: vec![],
            handle_copy,
        };

        let cancel = CancellationToken::new();
        let result = engine.try_copy_and_put(request, &cancel).await;
        assert!(matches!(result, Err(CopyError::DestinationFull { .. })));
        assert_eq!(copier.calls.load(Ordering::SeqCst), 1, "must not attempt a second replica");
    }

    #[tokio::test]
    async fn invalid_hash_tries_next_replica_without_reputation_change() {
        let payload = b"second replica has the real bytes".to_vec();
        let hash = hash_for(&payload);
        let copier = Arc::new(ScriptedCopier {
            results: Mutex::new(std::collections::VecDeque::from([
                (CopyFileResultCode::InvalidHash, Vec::new()),
                (CopyFileResultCode::Success, payload.clone()),
            ])),
        });
        let reporter = Arc::new(RecordingReporter { calls: Mutex::new(Vec::new()) });
        let engine = CopyEngine::new(
            Arc::new(CopyScheduler::new(Default::default())),
            test_config(),
            Arc::new(FnvHasherFactory),
            copier,
            reporter.clone(),
        );

        let handle_copy: HandleCopy = Arc::new(move |_path, _info| Box::pin(async { Ok(()) }));
        let request = CopyRequest {
            hash_info: ContentHashWithSize::new(hash, SizeHint::Known(payload.len() as u64)),
            candidates: vec![MachineLocation("peer-a".into()), MachineLocation("peer-b".into())],
            ring_members: vec![],
            handle_copy,
        };

        let cancel = CancellationToken::new();
        let result = engine.try_copy_and_put(request, &cancel).await.unwrap();
        assert_eq!(result.size, SizeHint::Known(payload.len() as u64));

        let calls = reporter.calls.lock().unwrap();
        assert_eq!(calls.len(), 1, "InvalidHash must not produce a reputation report");
        assert_eq!(calls[0].1, Reputation::Good);
    }
}
