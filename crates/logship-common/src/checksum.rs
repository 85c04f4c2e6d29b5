//! Checksum utilities for Logship
//!
//! CRC32C protects persisted snapshots; xxHash64 fingerprints schemas.

/// Compute the CRC32C of a byte slice
#[must_use]
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Order-sensitive fingerprint of a list of strings
///
/// Each element is length-prefixed so `["ab", "c"]` and `["a", "bc"]` hash
/// differently.
pub struct SchemaHasher {
    state: xxhash_rust::xxh64::Xxh64,
}

impl SchemaHasher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: xxhash_rust::xxh64::Xxh64::new(0),
        }
    }

    /// Feed an ordered list
    pub fn update_list(&mut self, items: &[String]) {
        self.state.update(&(items.len() as u64).to_le_bytes());
        for item in items {
            self.state.update(&(item.len() as u64).to_le_bytes());
            self.state.update(item.as_bytes());
        }
    }

    #[must_use]
    pub fn finish(&self) -> u64 {
        self.state.digest()
    }
}

impl Default for SchemaHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_detects_change() {
        assert_ne!(crc32c(b"logship"), crc32c(b"logshiq"));
        assert_eq!(crc32c(b""), 0);
    }

    #[test]
    fn test_schema_hasher_boundaries() {
        let mut a = SchemaHasher::new();
        a.update_list(&["ab".to_string(), "c".to_string()]);
        let mut b = SchemaHasher::new();
        b.update_list(&["a".to_string(), "bc".to_string()]);
        assert_ne!(a.finish(), b.finish());
    }
}
