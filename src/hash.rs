//! Content-addressable identifiers: hashes, sized hash info, and peer locations.
//!
//! A [`ContentHash`] never owns a hashing algorithm — it is a tagged, fixed-width
//! byte payload whose "meaningful" prefix length is a function of the tag. The
//! actual digest function lives outside this crate (see [`crate::hasher`]); only
//! the wire-stable shape of a hash is specified here.

use std::cmp::Ordering;
use std::fmt;

/// Maximum payload width any supported hash type can carry.
pub const MAX_HASH_BYTES: usize = 32;

/// Number of bytes shown by [`ContentHash::short`].
pub const SHORT_HASH_BYTES: usize = 8;

/// Tag identifying which hashing algorithm produced a [`ContentHash`].
///
/// `Unknown` exists only as the zero value of the wire tag byte; a
/// [`ContentHash`] carrying it is never valid and construction rejects it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum HashType {
    Unknown = 0,
    Sha256 = 1,
    Vso0 = 2,
    DedupNode64K = 3,
    DedupChunk = 4,
}

impl HashType {
    /// Length, in bytes, of the meaningful (non-padding) payload for this tag.
    pub const fn meaningful_len(self) -> usize {
        match self {
            HashType::Unknown => 0,
            HashType::Sha256 => 32,
            HashType::Vso0 => 32,
            HashType::DedupNode64K => 33,
            HashType::DedupChunk => 32,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(HashType::Sha256),
            2 => Some(HashType::Vso0),
            3 => Some(HashType::DedupNode64K),
            4 => Some(HashType::DedupChunk),
            _ => None,
        }
    }
}

/// Error returned when a [`ContentHash`] cannot be constructed or parsed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HashError {
    #[error("hash type tag {0} is not a known hash type")]
    UnknownTag(u8),
    #[error("hash payload has {actual} bytes, expected at least {expected}")]
    PayloadTooShort { expected: usize, actual: usize },
    #[error("hash payload has {actual} bytes, the maximum is {max}")]
    PayloadTooLong { actual: usize, max: usize },
}

/// A tagged content identifier: a hash-type tag plus a fixed-width byte payload.
///
/// Equality and ordering only ever consider the tag's meaningful prefix — bytes
/// beyond `hash_type.meaningful_len()` are padding and never compared.
#[derive(Clone, Copy)]
pub struct ContentHash {
    hash_type: HashType,
    bytes: [u8; MAX_HASH_BYTES],
}

impl ContentHash {
    /// Builds a hash from an exact-length (or shorter, zero-padded) byte slice.
    pub fn new(hash_type: HashType, payload: &[u8]) -> Result<Self, HashError> {
        if hash_type == HashType::Unknown {
            return Err(HashError::UnknownTag(0));
        }
        let needed = hash_type.meaningful_len();
        if payload.len() < needed {
            return Err(HashError::PayloadTooShort {
                expected: needed,
                actual: payload.len(),
            });
        }
        if payload.len() > MAX_HASH_BYTES {
            return Err(HashError::PayloadTooLong {
                actual: payload.len(),
                max: MAX_HASH_BYTES,
            });
        }
        let mut bytes = [0u8; MAX_HASH_BYTES];
        bytes[..payload.len()].copy_from_slice(payload);
        Ok(Self { hash_type, bytes })
    }

    pub fn hash_type(&self) -> HashType {
        self.hash_type
    }

    /// The meaningful payload bytes (no trailing padding).
    pub fn meaningful_bytes(&self) -> &[u8] {
        &self.bytes[..self.hash_type.meaningful_len()]
    }

    /// Serializes as one tag byte followed by the meaningful-length payload.
    pub fn serialize_trimmed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.hash_type.meaningful_len());
        out.push(self.hash_type as u8);
        out.extend_from_slice(self.meaningful_bytes());
        out
    }

    /// Serializes as one tag byte followed by the fixed maximum-length payload.
    pub fn serialize_full(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + MAX_HASH_BYTES);
        out.push(self.hash_type as u8);
        out.extend_from_slice(&self.bytes);
        out
    }

    /// Reconstructs a hash from either a trimmed or a full serialization.
    pub fn parse(buf: &[u8]) -> Result<Self, HashError> {
        let (&tag, payload) = buf
            .split_first()
            .ok_or(HashError::PayloadTooShort { expected: 1, actual: 0 })?;
        let hash_type = HashType::from_tag(tag).ok_or(HashError::UnknownTag(tag))?;
        Self::new(hash_type, payload)
    }

    /// Truncated hex form used for logging; never used for equality.
    pub fn short(&self) -> String {
        let n = self.hash_type.meaningful_len().min(SHORT_HASH_BYTES);
        hex::encode(&self.bytes[..n])
    }
}

impl PartialEq for ContentHash {
    fn eq(&self, other: &Self) -> bool {
        self.hash_type == other.hash_type && self.meaningful_bytes() == other.meaningful_bytes()
    }
}
impl Eq for ContentHash {}

impl std::hash::Hash for ContentHash {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash_type.hash(state);
        self.meaningful_bytes().hash(state);
    }
}

impl PartialOrd for ContentHash {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ContentHash {
    fn cmp(&self, other: &Self) -> Ordering {
        self.meaningful_bytes()
            .cmp(other.meaningful_bytes())
            .then_with(|| self.hash_type.cmp(&other.hash_type))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({:?}:{})", self.hash_type, self.short())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// A byte size that may be unknown until a copy completes ("-1" in the source design).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeHint {
    Known(u64),
    Unknown,
}

impl SizeHint {
    pub fn known(self) -> Option<u64> {
        match self {
            SizeHint::Known(n) => Some(n),
            SizeHint::Unknown => None,
        }
    }
}

/// A hash paired with its (possibly unknown) byte size.
#[derive(Clone, Debug)]
pub struct ContentHashWithSize {
    pub hash: ContentHash,
    pub size: SizeHint,
}

impl ContentHashWithSize {
    pub fn new(hash: ContentHash, size: SizeHint) -> Self {
        Self { hash, size }
    }
}

/// Opaque identifier for a cluster member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachineId(pub u64);

/// Opaque network-reachable address for a cluster member.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MachineLocation(pub String);

impl fmt::Display for MachineLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a [`ContentHashWithSizeAndLocations`] came from, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocationOrigin {
    ContentResolver,
    LocalOnly,
}

/// A hash, its size, and the ordered set of peers believed to hold it.
///
/// Candidate order is the search order the copy engine walks in.
#[derive(Clone, Debug)]
pub struct ContentHashWithSizeAndLocations {
    pub hash_info: ContentHashWithSize,
    pub locations: Vec<MachineLocation>,
    pub filtered_out_locations: Vec<MachineLocation>,
    pub origin: LocationOrigin,
}

impl ContentHashWithSizeAndLocations {
    pub fn hash(&self) -> &ContentHash {
        &self.hash_info.hash
    }
}
