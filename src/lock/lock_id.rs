use std::fmt;

use sha2::{Digest, Sha256};

/// Identity of a lock, derived from everything folded into its builder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockId(String);

impl LockId {
    pub fn builder() -> LockIdBuilder {
        LockIdBuilder::default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accumulates opaque blobs; `build` consumes it, so an id can never change
/// after it has been read.
#[derive(Debug, Default, Clone)]
pub struct LockIdBuilder {
    parts: Vec<Vec<u8>>,
}

impl LockIdBuilder {
    pub fn with(mut self, data: impl AsRef<[u8]>) -> Self {
        self.parts.push(data.as_ref().to_vec());
        self
    }

    pub fn build(self) -> LockId {
        let mut hasher = Sha256::new();
        for part in &self.parts {
            // length prefix keeps ["ab", "c"] and ["a", "bc"] apart
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        LockId(format!("{:x}", hasher.finalize()))
    }
}
