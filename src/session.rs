//! The ephemeral content session: the three-tier read/write surface a build
//! participant actually calls, built on top of the local/persistent store
//! contracts, the resolver, and the copy engine.

use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncSeekExt;
use tokio_util::sync::CancellationToken;

use crate::copy_engine::{CopyEngine, CopyRequest, HandleCopy};
use crate::error::SessionError;
use crate::hash::{ContentHash, ContentHashWithSize, SizeHint};
use crate::host::EphemeralHost;
use crate::resolver::{partition_locations, GetLocationsRequest};
use crate::store::{
    AccessMode, ContentSession, ContentSource, LocalContentSession, PersistentContentSession, PlaceFileResult,
    PlacedContent, PutContent, PutResult, RealizationMode, ReplacementMode, SeekableAsyncRead,
};

/// A build participant's handle onto the three content tiers.
///
/// Cheap to construct per build step; the expensive shared state (scheduler,
/// single-flight gate, elision cache, cluster view) lives on [`EphemeralHost`]
/// and is reused across every session the host opens.
pub struct EphemeralContentSession {
    /// Identifies this session in trace spans; the build orchestrator opens
    /// one session per build step, so correlating log lines by session id is
    /// how a slow `place_file` gets tied back to the step that issued it.
    pub session_id: uuid::Uuid,
    host: Arc<EphemeralHost>,
    local: Arc<dyn LocalContentSession>,
    persistent: Arc<dyn PersistentContentSession>,
    copy_engine: Arc<CopyEngine>,
}

impl EphemeralContentSession {
    pub fn new(
        host: Arc<EphemeralHost>,
        local: Arc<dyn LocalContentSession>,
        persistent: Arc<dyn PersistentContentSession>,
        copy_engine: Arc<CopyEngine>,
    ) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4(),
            host,
            local,
            persistent,
            copy_engine,
        }
    }

    pub async fn pin(&self, hash: &ContentHash) -> Result<(), SessionError> {
        if self.local.pin(hash).await.is_ok() {
            return Ok(());
        }
        self.persistent.pin(hash).await
    }

    pub async fn pin_bulk(&self, hashes: &[ContentHash]) -> Result<Vec<Result<(), SessionError>>, SessionError> {
        let mut results = Vec::with_capacity(hashes.len());
        for hash in hashes {
            results.push(self.pin(hash).await);
        }
        Ok(results)
    }

    /// Places `hash` at `destination`, trying the local cache, then the
    /// datacenter ring, then the persistent store, in that order.
    pub async fn place_file(
        &self,
        hash: &ContentHash,
        destination: &Path,
        access: AccessMode,
        replacement: ReplacementMode,
        realization: RealizationMode,
        cancel: &CancellationToken,
    ) -> PlaceFileResult {
        let (placed, populate) = self
            .place_file_inner(hash, destination, access, replacement, realization, cancel)
            .await?;
        // Detached: ordinary callers don't need the local cache populated by
        // the time this returns, only eventually. `open_stream` awaits the
        // same handle itself instead of calling this wrapper — see its decl.
        drop(populate);
        Ok(placed)
    }

    /// Core three-tier walk shared by [`Self::place_file`] and
    /// [`Self::open_stream`]. Returns the placed content plus, when the
    /// persistent tier had to be used, a join handle for the best-effort
    /// local-cache population task so callers that need the populate to
    /// finish before touching `destination` again can await it themselves.
    async fn place_file_inner(
        &self,
        hash: &ContentHash,
        destination: &Path,
        access: AccessMode,
        replacement: ReplacementMode,
        realization: RealizationMode,
        cancel: &CancellationToken,
    ) -> Result<(PlacedContent, Option<tokio::task::JoinHandle<()>>), SessionError> {
        tracing::debug!(session_id = %self.session_id, hash = %hash, "place_file");

        if let Ok(placed) = self
            .local
            .place_file(hash, destination, access, replacement, realization)
            .await
        {
            self.note_placed(&placed);
            return Ok((placed, None));
        }

        let _guard = self.host.single_flight.acquire(hash.clone(), cancel).await.map_err(|_| SessionError::Cancelled)?;

        // Another caller may have populated local cache while we were waiting
        // for the gate; re-check before going to the network.
        if let Ok(placed) = self
            .local
            .place_file(hash, destination, access, replacement, realization)
            .await
        {
            self.note_placed(&placed);
            return Ok((placed, None));
        }

        if let Some(placed) = self.try_datacenter_place(hash, destination, access, replacement, realization, cancel).await? {
            self.note_placed(&placed);
            return Ok((placed, None));
        }

        let placed = self
            .persistent
            .place_file(hash, destination, access, replacement, realization)
            .await?;

        // Best-effort local population so the next local request is a hit;
        // failure here never fails the caller's placement.
        let local = self.local.clone();
        let hash = hash.clone();
        let destination = destination.to_path_buf();
        let populate = tokio::spawn(async move {
            let _ = local
                .put_file(Some(hash), &destination, RealizationMode::Copy)
                .await;
        });

        let placed = PlacedContent {
            source: ContentSource::BackingStore,
            ..placed
        };
        self.note_placed(&placed);

        Ok((placed, Some(populate)))
    }

    /// Records a successful place in the elision cache per §4.5 steps 1/3/4 —
    /// a later `put` of the same content can short-circuit on this hint
    /// instead of re-checking the persistent store.
    fn note_placed(&self, placed: &PlacedContent) {
        self.host
            .elision_cache
            .try_add(placed.hash, placed.size, self.host.config.put_cache_ttl);
    }

    /// Opens `hash` for reading without a caller-supplied destination path.
    ///
    /// Implemented as: place into a private temp file, open a read handle on
    /// it, then unlink it — on POSIX the open file descriptor keeps the data
    /// alive after the directory entry is gone, so the returned stream reads
    /// normally and the OS reclaims the backing storage the moment the
    /// handle closes, with no separate cleanup call for the caller to
    /// forget. This relies on POSIX unlink-while-open semantics and is not
    /// portable to filesystems without them.
    ///
    /// §9's open question is the ordering between that unlink and
    /// `place_file`'s best-effort local-cache populate task on the
    /// persistent-fallback path: that task re-opens the same temp path by
    /// name to warm the local store, and if `open_stream` unlinks first, the
    /// populate's open fails outright. Resolution taken here: `open_stream`
    /// awaits the populate task's completion before unlinking, so the two
    /// never race — at the cost of `open_stream` occasionally waiting on a
    /// local-cache write its caller doesn't otherwise need.
    pub async fn open_stream(
        &self,
        hash: &ContentHash,
        cancel: &CancellationToken,
    ) -> Result<OpenedStream, SessionError> {
        tracing::debug!(session_id = %self.session_id, hash = %hash, "open_stream");

        let named = tempfile::Builder::new()
            .prefix("open-stream-")
            .tempfile_in(&self.host.working_folder)
            .map_err(|e| SessionError::Other(e.to_string()))?;
        let path = named
            .into_temp_path()
            .keep()
            .map_err(|e| SessionError::Other(e.to_string()))?;

        let placement = self
            .place_file_inner(hash, &path, AccessMode::Read, ReplacementMode::ReplaceExisting, RealizationMode::Copy, cancel)
            .await;
        let (_placed, populate) = match placement {
            Ok(v) => v,
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
        };

        if let Some(populate) = populate {
            let _ = populate.await;
        }

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(SessionError::Other(e.to_string()));
            }
        };
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| SessionError::Other(e.to_string()))?;

        Ok(OpenedStream { file })
    }

    async fn try_datacenter_place(
        &self,
        hash: &ContentHash,
        destination: &Path,
        access: AccessMode,
        replacement: ReplacementMode,
        realization: RealizationMode,
        cancel: &CancellationToken,
    ) -> Result<Option<PlacedContent>, SessionError> {
        let results = self
            .host
            .resolver
            .get_locations(GetLocationsRequest::single(hash.clone()))
            .await?;
        let Some(result) = results.into_iter().next() else {
            return Ok(None);
        };
        if result.existing().is_empty() {
            return Ok(None);
        }

        let partitioned = partition_locations(self.host.cluster.as_ref(), result.existing());
        if partitioned.active.is_empty() {
            return Ok(None);
        }

        let local = self.local.clone();
        let handle_copy: HandleCopy = Arc::new(move |temp_path, hash_info| {
            let local = local.clone();
            Box::pin(async move {
                local
                    .put_trusted_file(&hash_info, &temp_path, RealizationMode::Copy)
                    .await
                    .map(|_| ())
                    .map_err(|e| crate::error::CopyError::PutRejected { detail: e.to_string() })
            })
        });

        // `ring_members` is the subset of candidates the resolver did not
        // itself name but that the cluster ring made available; this
        // resolver only ever reports resolved locations, so there is none —
        // every candidate here came from `get_locations` directly.
        let request = CopyRequest {
            hash_info: ContentHashWithSize::new(hash.clone(), result.size),
            ring_members: Vec::new(),
            candidates: partitioned.active,
            handle_copy,
        };

        match self.copy_engine.try_copy_and_put(request, cancel).await {
            Ok(_) => {
                let placed = self
                    .local
                    .place_file(hash, destination, access, replacement, realization)
                    .await?;
                Ok(Some(PlacedContent {
                    source: ContentSource::DatacenterCache,
                    ..placed
                }))
            }
            Err(crate::error::CopyError::NotFound { .. }) => Ok(None),
            Err(e) => Err(SessionError::Copy(e)),
        }
    }

    /// Puts `path` into the local cache and, unless the content is already
    /// known to be reachable elsewhere, the persistent store. `Move`
    /// realization never reaches the persistent tier — the source file is
    /// gone after the local move completes, so there is nothing left to push.
    pub async fn put_file(
        &self,
        hash: Option<ContentHash>,
        path: &Path,
        realization: RealizationMode,
        cancel: &CancellationToken,
    ) -> PutResult {
        let local_result = self.local.put_file(hash, path, realization).await?;

        if local_result.already_exists {
            return Ok(local_result);
        }

        if realization == RealizationMode::Move {
            return Ok(local_result);
        }

        self.push_to_persistent_if_absent(local_result, path, cancel).await
    }

    /// Same contract as [`Self::put_file`] but for an in-memory/seekable
    /// stream source.
    ///
    /// The stream is first fully consumed by the local put, then rewound and
    /// handed to the persistent put. The two are deliberately sequenced
    /// rather than run concurrently: `AsyncRead` gives no guarantee that two
    /// concurrent readers over the same handle see consistent data, and a
    /// second independent stream isn't available from a single `Read` source.
    pub async fn put_stream(
        &self,
        hash: Option<ContentHash>,
        stream: &mut dyn SeekableAsyncRead,
        cancel: &CancellationToken,
    ) -> PutResult {
        let local_result = self.local.put_stream(hash, stream).await?;

        stream
            .seek(std::io::SeekFrom::Start(0))
            .await
            .map_err(|e| SessionError::Other(e.to_string()))?;

        let exists_elsewhere = self.exists_elsewhere(&local_result.hash).await?;
        if exists_elsewhere {
            return Ok(local_result);
        }

        let _guard = self
            .host
            .single_flight
            .acquire(local_result.hash.clone(), cancel)
            .await
            .map_err(|_| SessionError::Cancelled)?;

        if self.host.elision_cache.try_get(&local_result.hash).is_some() {
            return Ok(local_result);
        }

        let persistent_result = self
            .persistent
            .put_stream(Some(local_result.hash.clone()), stream)
            .await?;
        self.host
            .elision_cache
            .try_add(local_result.hash.clone(), persistent_result.size, self.host.config.put_cache_ttl);

        Ok(local_result)
    }

    async fn push_to_persistent_if_absent(&self, local_result: PutContent, path: &Path, cancel: &CancellationToken) -> PutResult {
        if self.host.elision_cache.try_get(&local_result.hash).is_some() {
            return Ok(local_result);
        }

        if self.exists_elsewhere(&local_result.hash).await? {
            self.host
                .elision_cache
                .try_add(local_result.hash.clone(), local_result.size, self.host.config.put_cache_ttl);
            return Ok(local_result);
        }

        let _guard = self
            .host
            .single_flight
            .acquire(local_result.hash.clone(), cancel)
            .await
            .map_err(|_| SessionError::Cancelled)?;

        // Re-check: a concurrent pusher may have finished while we waited.
        if self.host.elision_cache.try_get(&local_result.hash).is_some() {
            return Ok(local_result);
        }

        let persistent_result = self
            .persistent
            .put_file(Some(local_result.hash.clone()), path, RealizationMode::Copy)
            .await?;

        self.host.elision_cache.try_add(
            persistent_result.hash.clone(),
            persistent_result.size,
            self.host.config.put_cache_ttl,
        );

        Ok(local_result)
    }

    /// True when some peer distinct from this machine is live and holds
    /// `hash` — either a build participant already tracking it locally, or a
    /// resolver-reported machine that isn't this machine's own primary id
    /// and isn't reported inactive by the cluster view.
    async fn exists_elsewhere(&self, hash: &ContentHash) -> Result<bool, SessionError> {
        if self.local.tracked_elsewhere_locally(hash).await {
            return Ok(true);
        }
        let Some(result) = self.host.resolver.get_single_location(hash).await? else {
            return Ok(false);
        };
        let primary = self.host.cluster.primary_machine_id();
        let machine_ids: Vec<_> = result.machine_ids.into_iter().filter(|id| *id != primary).collect();
        let partitioned = partition_locations(self.host.cluster.as_ref(), &machine_ids);
        Ok(!partitioned.active.is_empty())
    }
}

/// A content stream returned by [`EphemeralContentSession::open_stream`].
///
/// The backing file has already been unlinked by the time a caller sees
/// this; reading it is the only way to get at the bytes, and dropping it
/// without reading to the end simply releases the descriptor early.
pub struct OpenedStream {
    file: tokio::fs::File,
}

impl tokio::io::AsyncRead for OpenedStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}
