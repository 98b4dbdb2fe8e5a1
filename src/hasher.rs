//! The digest-function contract this crate consumes but never implements.
//!
//! Per scope, the actual hash algorithm (SHA-256, a VSO/dedup variant, …) is an
//! external collaborator. Callers hand the copy engine and the stores a
//! [`HasherFactory`]; this crate only ever calls into it.

use crate::hash::{ContentHash, HashType};

/// An incremental hash computation over a byte stream.
pub trait IncrementalHasher: Send {
    fn update(&mut self, bytes: &[u8]);
    fn finish(self: Box<Self>) -> ContentHash;
}

/// Produces fresh [`IncrementalHasher`] instances for a given hash type.
pub trait HasherFactory: Send + Sync {
    fn start(&self, hash_type: HashType) -> Box<dyn IncrementalHasher>;

    /// Convenience one-shot hash of a complete buffer.
    fn digest(&self, hash_type: HashType, bytes: &[u8]) -> ContentHash {
        let mut hasher = self.start(hash_type);
        hasher.update(bytes);
        hasher.finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A cheap, non-cryptographic stand-in for the real digest function, used
    //! only so tests can exercise hash-verification code paths without
    //! pulling in an actual hashing crate the production code never needs.

    use super::*;

    pub struct FnvHasher {
        state: u64,
        hash_type: HashType,
    }

    impl IncrementalHasher for FnvHasher {
        fn update(&mut self, bytes: &[u8]) {
            for &b in bytes {
                self.state ^= b as u64;
                self.state = self.state.wrapping_mul(0x100000001b3);
            }
        }

        fn finish(self: Box<Self>) -> ContentHash {
            let mut payload = [0u8; 32];
            payload[..8].copy_from_slice(&self.state.to_le_bytes());
            ContentHash::new(self.hash_type, &payload).expect("fixed-size payload is valid")
        }
    }

    pub struct FnvHasherFactory;

    impl HasherFactory for FnvHasherFactory {
        fn start(&self, hash_type: HashType) -> Box<dyn IncrementalHasher> {
            Box::new(FnvHasher {
                state: 0xcbf29ce484222325,
                hash_type,
            })
        }
    }

    #[test]
    fn digest_is_deterministic() {
        let factory = FnvHasherFactory;
        let a = factory.digest(HashType::Sha256, b"hello world");
        let b = factory.digest(HashType::Sha256, b"hello world");
        assert_eq!(a, b);
        let c = factory.digest(HashType::Sha256, b"hello worlD");
        assert_ne!(a, c);
    }
}
