//! The local and persistent content session contracts.
//!
//! Both store implementations are external collaborators — only their shape
//! is defined here, so the session and copy engine can be written against a
//! trait instead of a concrete store.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek};

use crate::error::SessionError;
use crate::hash::{ContentHash, ContentHashWithSize};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplacementMode {
    ReplaceExisting,
    SkipIfExists,
    FailIfExists,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RealizationMode {
    Copy,
    Hardlink,
    /// Rejected by `put_file` — the persistent store must never be reached by a move.
    Move,
}

/// Which tier answered a `place_file` or `put_file` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentSource {
    LocalCache,
    DatacenterCache,
    BackingStore,
}

#[derive(Clone, Debug)]
pub struct PlacedContent {
    pub hash: ContentHash,
    pub size: u64,
    pub source: ContentSource,
    pub already_exists: bool,
}

pub type PlaceFileResult = Result<PlacedContent, SessionError>;

#[derive(Clone, Debug)]
pub struct PutContent {
    pub hash: ContentHash,
    pub size: u64,
    pub already_exists: bool,
}

pub type PutResult = Result<PutContent, SessionError>;

/// A seekable async byte stream, required by `put_stream` so the local put's
/// consumption of the stream can be rewound before the persistent put reads it.
pub trait SeekableAsyncRead: AsyncRead + AsyncSeek + Send + Unpin {}
impl<T: AsyncRead + AsyncSeek + Send + Unpin> SeekableAsyncRead for T {}

/// Operations common to both the local and the persistent content session.
#[async_trait]
pub trait ContentSession: Send + Sync {
    async fn pin(&self, hash: &ContentHash) -> Result<(), SessionError>;

    async fn pin_bulk(&self, hashes: &[ContentHash]) -> Result<Vec<Result<(), SessionError>>, SessionError> {
        let mut results = Vec::with_capacity(hashes.len());
        for hash in hashes {
            results.push(self.pin(hash).await);
        }
        Ok(results)
    }

    async fn place_file(
        &self,
        hash: &ContentHash,
        path: &Path,
        access: AccessMode,
        replacement: ReplacementMode,
        realization: RealizationMode,
    ) -> PlaceFileResult;

    async fn put_file(&self, hash: Option<ContentHash>, path: &Path, realization: RealizationMode) -> PutResult;

    async fn put_stream(
        &self,
        hash: Option<ContentHash>,
        stream: &mut (dyn SeekableAsyncRead),
    ) -> PutResult;
}

/// Local-store-only capability: accept bytes already verified by the copy
/// engine without re-hashing them.
#[async_trait]
pub trait LocalContentSession: ContentSession {
    async fn put_trusted_file(
        &self,
        hash_info: &ContentHashWithSize,
        temp_path: &Path,
        realization: RealizationMode,
    ) -> PutResult;

    /// Whether some other build participant on this machine (not necessarily
    /// this session) already has `hash`, used by `ExistsElsewhere`.
    async fn tracked_elsewhere_locally(&self, hash: &ContentHash) -> bool;
}

/// The persistent store's contract is identical to the common session trait;
/// this alias exists so call sites read as intent, not as an accidental type match.
pub trait PersistentContentSession: ContentSession {}
impl<T: ContentSession + ?Sized> PersistentContentSession for T {}
