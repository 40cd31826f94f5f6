use std::collections::BTreeMap;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Digest algorithm name to lowercase hex digest.
pub type Checksums = BTreeMap<String, String>;

pub const SHA256: &str = "sha256";

/// Incremental SHA-256 for data that arrives in pieces (uploads).
#[derive(Default, Clone)]
pub struct ChecksumWriter {
    sha256: Sha256,
    size: u64,
}

impl ChecksumWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.sha256.update(chunk);
        self.size += chunk.len() as u64;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finish(self) -> Checksums {
        let mut sums = Checksums::new();
        sums.insert(SHA256.to_string(), hex::encode(self.sha256.finalize()));
        sums
    }
}

impl std::io::Write for ChecksumWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for ChecksumWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumWriter")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

pub fn checksum_bytes(data: &[u8]) -> Checksums {
    let mut writer = ChecksumWriter::new();
    writer.update(data);
    writer.finish()
}

/// Hash a file from disk. Blocking; call from `spawn_blocking` in async code.
pub fn checksum_file(path: &Path) -> std::io::Result<Checksums> {
    let mut file = std::fs::File::open(path)?;
    let mut writer = ChecksumWriter::new();
    std::io::copy(&mut file, &mut writer)?;
    Ok(writer.finish())
}
