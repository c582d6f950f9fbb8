//! Content-addressed attachment storage under `attachments/`.
//!
//! Files are named by the SHA-256 of their contents, so identical files
//! share one copy. Records refer to them by the relative path
//! `attachments/<hex>`, which keeps the buffer directory relocatable.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use instalog_core::error::BufferError;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::state::ATTACHMENTS_DIR;

pub(crate) struct AttachmentStore {
    root: PathBuf,
    dir: PathBuf,
}

impl AttachmentStore {
    /// Opens the store under buffer directory `root`.
    pub(crate) fn open(root: &Path) -> io::Result<Self> {
        let dir = root.join(ATTACHMENTS_DIR);
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            root: root.to_path_buf(),
            dir,
        })
    }

    /// Copies `source` into the store and returns its relative path.
    ///
    /// The source is left in place; callers remove it once the record that
    /// references the copy is durable.
    pub(crate) fn import(&self, id: &str, source: &Path) -> Result<PathBuf, BufferError> {
        let fail = |reason: String| BufferError::Attachment {
            id: id.to_owned(),
            path: source.display().to_string(),
            reason,
        };

        if let Some(name) = self.stored_name(source) {
            return Ok(relative(name));
        }

        let mut input = File::open(source).map_err(|e| fail(e.to_string()))?;
        let mut staged = NamedTempFile::new_in(&self.dir)?;
        let mut hasher = Sha256::new();
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            let read = input.read(&mut chunk).map_err(|e| fail(e.to_string()))?;
            if read == 0 {
                break;
            }
            hasher.update(&chunk[..read]);
            staged.write_all(&chunk[..read])?;
        }

        let name = hex::encode(hasher.finalize());
        let dest = self.dir.join(&name);
        if dest.exists() {
            debug!(attachment = %name, "attachment already stored");
        } else {
            staged.as_file().sync_all()?;
            staged.persist(&dest).map_err(|e| BufferError::Io(e.error))?;
        }
        Ok(relative(&name))
    }

    /// Absolute path of a relative attachment reference.
    pub(crate) fn resolve(&self, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.root.join(relative)
        }
    }

    /// True when `path` already lives in this store.
    pub(crate) fn contains(&self, path: &Path) -> bool {
        self.stored_name(path).is_some()
    }

    /// Deletes every stored file not named in `referenced`.
    pub(crate) fn collect_garbage(&self, referenced: &HashSet<String>) -> io::Result<u64> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let keep = name.to_str().is_some_and(|n| referenced.contains(n));
            if keep {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "cannot remove attachment"),
            }
        }
        Ok(removed)
    }

    /// File name of `path` if it already lives in this store.
    fn stored_name<'a>(&self, path: &'a Path) -> Option<&'a str> {
        let absolute = self.resolve(path);
        if absolute.parent() != Some(self.dir.as_path()) {
            return None;
        }
        path.file_name().and_then(|n| n.to_str())
    }
}

fn relative(name: &str) -> PathBuf {
    Path::new(ATTACHMENTS_DIR).join(name)
}

/// Stored file name of a relative reference, if it has one.
pub(crate) fn stored_file_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_owned)
}
