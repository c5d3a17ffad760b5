use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Deterministic hasher for structural fingerprints (batch signatures, plan keys).
///
/// `DefaultHasher::new()` uses fixed keys, so fingerprints are stable within a build.
pub struct FingerprintHasher {
    inner: DefaultHasher,
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self {
            inner: DefaultHasher::new(),
        }
    }

    pub fn write<T: Hash + ?Sized>(&mut self, value: &T) {
        value.hash(&mut self.inner);
    }

    pub fn finish(self) -> u64 {
        self.inner.finish()
    }
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}

pub fn hash_value<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = FingerprintHasher::new();
    hasher.write(value);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_values_share_fingerprints() {
        assert_eq!(hash_value(&[1u32, 2, 3]), hash_value(&[1u32, 2, 3]));
        assert_ne!(hash_value(&[1u32, 2, 3]), hash_value(&[3u32, 2, 1]));
    }
}
