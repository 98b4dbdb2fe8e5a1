//! Host-level collaborators: reputation reporting and the wiring struct that
//! hands a configured [`CopyEngine`](crate::copy_engine::CopyEngine) and
//! [`EphemeralContentSession`](crate::session::EphemeralContentSession) their
//! shared state.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{EngineConfig, SchedulerConfig};
use crate::elision::ElisionCache;
use crate::hash::MachineLocation;
use crate::resolver::{ClusterState, ContentResolver};
use crate::scheduler::CopyScheduler;
use crate::single_flight::SingleFlightGate;

/// A peer's observed reliability, reported after each copy attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reputation {
    Good,
    Bad,
    Missing,
    Timeout,
}

/// Fire-and-forget sink for long-lived peer reliability tracking.
///
/// Distinct from the copy engine's own per-request `ReplicaTracker`: this
/// trait is how that in-memory, per-call bookkeeping escapes to whatever
/// host-wide reputation system the embedder runs (and it may outlive any one
/// session or request).
#[async_trait]
pub trait ReputationReporter: Send + Sync {
    async fn report(&self, location: &MachineLocation, reputation: Reputation);
}

/// What the copy engine tells the host after a single replica attempt, used
/// both for reputation reporting and for ring-membership diagnostics.
#[async_trait]
pub trait CopyResultReporter: Send + Sync {
    async fn report_copy_result(&self, location: &MachineLocation, reputation: Reputation, from_ring: bool);
}

/// A host adapter that does nothing beyond remembering its working folder —
/// useful for embedders that don't track peer reputation at all.
pub struct DummyHostAdapter {
    pub working_folder: PathBuf,
}

impl DummyHostAdapter {
    pub fn new(working_folder: impl Into<PathBuf>) -> Self {
        Self {
            working_folder: working_folder.into(),
        }
    }
}

#[async_trait]
impl ReputationReporter for DummyHostAdapter {
    async fn report(&self, _location: &MachineLocation, _reputation: Reputation) {}
}

#[async_trait]
impl CopyResultReporter for DummyHostAdapter {
    async fn report_copy_result(&self, _location: &MachineLocation, _reputation: Reputation, _from_ring: bool) {}
}

/// Shared state handed to every [`EphemeralContentSession`](crate::session::EphemeralContentSession)
/// the host opens: the cluster view, resolver, scheduler, single-flight gate,
/// elision cache, and reputation sink are all cheap to clone and meant to
/// outlive any one session.
pub struct EphemeralHost {
    pub cluster: Arc<dyn ClusterState>,
    pub resolver: Arc<dyn ContentResolver>,
    pub scheduler: Arc<CopyScheduler>,
    pub single_flight: Arc<SingleFlightGate<crate::hash::ContentHash>>,
    pub elision_cache: Arc<ElisionCache>,
    pub reputation: Arc<dyn CopyResultReporter>,
    pub config: EngineConfig,
    pub working_folder: PathBuf,
}

impl EphemeralHost {
    pub fn new(
        cluster: Arc<dyn ClusterState>,
        resolver: Arc<dyn ContentResolver>,
        reputation: Arc<dyn CopyResultReporter>,
        config: EngineConfig,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        let working_folder = config.workspace.clone();
        Self {
            cluster,
            resolver,
            scheduler: Arc::new(CopyScheduler::new(scheduler_config)),
            single_flight: Arc::new(SingleFlightGate::new()),
            elision_cache: Arc::new(ElisionCache::new()),
            reputation,
            config,
            working_folder,
        }
    }
}
