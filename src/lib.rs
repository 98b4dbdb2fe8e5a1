//! An ephemeral, three-tier content cache session for distributed build execution.
//!
//! Content moves through three tiers on every read and write: a per-machine
//! local cache, a datacenter-scoped peer ring reached through a resolver and
//! copy engine, and a persistent backing store used only when the first two
//! tiers miss. [`session::EphemeralContentSession`] is the surface a build
//! participant calls; [`host::EphemeralHost`] owns the state that's shared
//! across every session a single machine opens for the lifetime of a build.
//!
//! Loading configuration from environment or files, metrics export, and the
//! wire protocol to any particular peer or store implementation are all
//! outside this crate's scope — [`store::ContentSession`],
//! [`copy_engine::RemoteFileCopier`], [`resolver::ContentResolver`], and
//! [`hasher::HasherFactory`] are the seams an embedder fills in.

pub mod config;
pub mod copy_engine;
pub mod elision;
pub mod error;
pub mod hash;
pub mod hasher;
pub mod host;
pub mod resolver;
pub mod scheduler;
pub mod session;
pub mod single_flight;
pub mod store;
pub mod tracing_setup;

pub use config::{EngineConfig, EngineConfigBuilder, SchedulerConfig};
pub use error::{CopyError, SchedulerError, SessionError};
pub use hash::{ContentHash, HashType, MachineId, MachineLocation, SizeHint};
pub use host::EphemeralHost;
pub use session::EphemeralContentSession;
