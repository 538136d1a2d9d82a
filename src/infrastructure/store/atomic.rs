use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::application::ports::StoreError;

/// Write `value` as pretty JSON via a temp file in the same directory
/// followed by a rename, so a crash mid-write never leaves a torn file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::io(path, std::io::Error::other("path has no parent")))?;
    let bytes = serde_json::to_vec_pretty(value)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| StoreError::io(path, e))?;
    tmp.write_all(&bytes).map_err(|e| StoreError::io(path, e))?;
    tmp.flush().map_err(|e| StoreError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

/// Read and parse a JSON file, retrying the read once on parse failure: a
/// concurrent atomic rename can race a first read, a second read sees
/// either the old or the new complete file.
pub fn read_json_with_retry<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    match read_json(path) {
        Ok(value) => Ok(value),
        Err(StoreError::Corrupt { .. }) => read_json(path),
        Err(e) => Err(e),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = std::fs::read(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn atomic_write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        let value = Sample {
            name: "meeting".into(),
            count: 3,
        };

        write_json_atomic(&path, &value).unwrap();
        let loaded: Sample = read_json_with_retry(&path).unwrap();
        assert_eq!(loaded, value);
    }

    #[test]
    fn atomic_write_replaces_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");

        write_json_atomic(&path, &Sample { name: "a".into(), count: 1 }).unwrap();
        write_json_atomic(&path, &Sample { name: "b".into(), count: 2 }).unwrap();

        let loaded: Sample = read_json_with_retry(&path).unwrap();
        assert_eq!(loaded.name, "b");
    }

    #[test]
    fn corrupt_file_reports_corrupt_after_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let err = read_json_with_retry::<Sample>(&path).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn missing_file_reports_io() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_json_with_retry::<Sample>(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }
}
