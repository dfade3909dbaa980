//! Content-addressed photo storage.
//!
//! Photos are written as `<sha256-hex>.<ext>` under a single directory. The
//! file name doubles as the record's `photo_ref`.

use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub struct PhotoStore {
    dir: PathBuf,
}

impl PhotoStore {
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `bytes` and return the reference to store alongside the record.
    /// Saving the same photo twice yields the same reference, also when the
    /// saves race each other.
    pub fn save(&self, bytes: &[u8], extension: &str) -> io::Result<String> {
        let name = format!("{:x}.{extension}", Sha256::digest(bytes));

        let path = self.dir.join(&name);
        if !path.exists() {
            // Each writer gets its own temp file; renaming over an identical
            // file is harmless.
            let mut tmp = NamedTempFile::new_in(&self.dir)?;
            io::Write::write_all(&mut tmp, bytes)?;
            tmp.persist(&path)?;
        }
        Ok(name)
    }

    /// Delete a photo. Missing files are not an error.
    pub fn remove(&self, photo_ref: &str) -> io::Result<()> {
        let path = self.resolve(photo_ref)?;
        match std::fs::remove_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Absolute path for a reference. Rejects anything that is not a plain
    /// file name inside the photo directory.
    pub fn resolve(&self, photo_ref: &str) -> io::Result<PathBuf> {
        let valid = !photo_ref.is_empty()
            && !photo_ref.starts_with('.')
            && !photo_ref.contains(['/', '\\']);
        if !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid photo reference {photo_ref:?}"),
            ));
        }
        Ok(self.dir.join(photo_ref))
    }
}
