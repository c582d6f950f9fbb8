//! Small JSON state files kept next to `data.log`.

use std::collections::BTreeMap;
use std::path::Path;

use instalog_core::error::BufferError;
use instalog_core::fsutil::atomic_write;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub(crate) const DATA_FILE: &str = "data.log";
pub(crate) const METADATA_FILE: &str = "metadata.json";
pub(crate) const CONSUMERS_FILE: &str = "consumers.json";
pub(crate) const ATTACHMENTS_DIR: &str = "attachments";

/// Sequence bounds as of the last truncation or close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Metadata {
    /// Lowest sequence that may still be in `data.log`
    pub first_seq: u64,
    pub last_seq: u64,
}

/// Consumer name → highest committed sequence.
pub(crate) type CommittedMap = BTreeMap<String, u64>;

/// Reads a state file, returning the default when it does not exist.
pub(crate) fn load<T: DeserializeOwned + Default>(path: &Path) -> Result<T, BufferError> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| BufferError::State {
            file: path.display().to_string(),
            reason: e.to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(BufferError::Io(e)),
    }
}

pub(crate) fn save<T: Serialize>(path: &Path, value: &T) -> Result<(), BufferError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| BufferError::State {
        file: path.display().to_string(),
        reason: e.to_string(),
    })?;
    atomic_write(path, &bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let meta: Metadata = load(&dir.path().join(METADATA_FILE)).unwrap();
        assert_eq!(meta, Metadata::default());
    }

    #[test]
    fn consumers_survive_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONSUMERS_FILE);
        let mut map = CommittedMap::new();
        map.insert("archive".into(), 12);
        save(&path, &map).unwrap();

        let loaded: CommittedMap = load(&path).unwrap();
        assert_eq!(loaded.get("archive"), Some(&12));
    }

    #[test]
    fn garbage_is_a_state_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(METADATA_FILE);
        std::fs::write(&path, b"not json").unwrap();
        let err = load::<Metadata>(&path).unwrap_err();
        assert!(matches!(err, BufferError::State { .. }));
    }
}
