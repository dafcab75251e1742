//! Integrity: CRC32 over icon blobs, one-shot or streamed.

/// CRC32 (IEEE) of a blob, as carried by IconEnd.
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Incremental CRC32 for data that is streamed to a sink rather than buffered.
#[derive(Default, Clone)]
pub struct RunningChecksum {
    hasher: crc32fast::Hasher,
}

impl RunningChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

impl std::fmt::Debug for RunningChecksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningChecksum")
            .field("crc", &self.value())
            .finish()
    }
}
