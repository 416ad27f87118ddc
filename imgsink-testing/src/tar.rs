//! Test helpers for building tar archives in memory, the way a cloning source would produce them.
use rand::prelude::*;
use std::io::Write;

/// A single entry in a test archive
#[derive(Clone, Debug)]
pub struct TestEntry {
    pub path: String,
    pub data: Vec<u8>,
    pub is_dir: bool,
}

impl TestEntry {
    /// A regular file with the given contents
    pub fn file(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            data,
            is_dir: false,
        }
    }

    /// A regular file of `size` random bytes
    pub fn random_file(path: impl Into<String>, size: usize) -> Self {
        let mut data = vec![0u8; size];
        rand::thread_rng().fill(&mut data[..]);

        Self::file(path, data)
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            data: Vec::new(),
            is_dir: true,
        }
    }
}

/// Builds an uncompressed tar archive from [`TestEntry`] values, in the order they're added
#[derive(Clone, Debug, Default)]
pub struct TarBuilder {
    entries: Vec<TestEntry>,
}

impl TarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, entry: TestEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Produce the archive bytes.
    ///
    /// Panics if the archive can't be written, which for an in-memory buffer only happens on a
    /// bad entry path.
    pub fn build(self) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        for entry in self.entries {
            let mut header = tar::Header::new_gnu();

            if entry.is_dir {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
            } else {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(entry.data.len() as u64);
            }
            header.set_mtime(0);

            builder
                .append_data(&mut header, &entry.path, entry.data.as_slice())
                .unwrap_or_else(|e| panic!("Failed to append '{}': {e}", entry.path));
        }

        builder.into_inner().expect("Failed to finish tar archive")
    }
}

/// Compress `data` with the snappy framing format, as used by filesystem and block device clones
pub fn snappy_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = snap::write::FrameEncoder::new(Vec::new());
    encoder
        .write_all(data)
        .expect("Writing to a Vec can't fail");

    encoder
        .into_inner()
        .unwrap_or_else(|e| panic!("Failed to finish snappy stream: {}", e.error()))
}
