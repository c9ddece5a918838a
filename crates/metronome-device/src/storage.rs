/// File-backed key-value storage for the configuration store. Each key
/// is one file under `dir`; writes go to a sibling `.tmp` file and are
/// renamed into place, so a save interrupted mid-write never corrupts
/// the previous value — `load` always sees either the old bytes or the
/// new ones, never a partial file.
use std::fs;
use std::path::{Path, PathBuf};

use metronome_protocol::error::{CoreError, CoreResult};

use crate::Storage;

pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.bin"))
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!(".{key}.bin.tmp"))
    }
}

impl Storage for FileStorage {
    fn load(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(None);
        }
        fs::read(&path)
            .map(Some)
            .map_err(|e| CoreError::StorageFailure(format!("read {key} failed: {e}")))
    }

    fn save(&self, key: &str, bytes: &[u8]) -> CoreResult<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| CoreError::StorageFailure(format!("create storage dir failed: {e}")))?;

        let tmp = self.tmp_path(key);
        let dest = self.key_path(key);

        fs::write(&tmp, bytes)
            .map_err(|e| CoreError::StorageFailure(format!("write {key} failed: {e}")))?;

        let file = fs::File::open(&tmp)
            .map_err(|e| CoreError::StorageFailure(format!("reopen {key} tmp failed: {e}")))?;
        file.sync_all()
            .map_err(|e| CoreError::StorageFailure(format!("fsync {key} failed: {e}")))?;

        fs::rename(&tmp, &dest)
            .map_err(|e| CoreError::StorageFailure(format!("rename {key} into place failed: {e}")))?;

        Ok(())
    }

    fn erase_all(&self) -> CoreResult<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.dir)
            .map_err(|e| CoreError::StorageFailure(format!("list storage dir failed: {e}")))?
        {
            let entry = entry
                .map_err(|e| CoreError::StorageFailure(format!("list storage dir failed: {e}")))?;
            let path: &Path = &entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("bin") {
                fs::remove_file(path)
                    .map_err(|e| CoreError::StorageFailure(format!("erase failed: {e}")))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(label: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "metronome-storage-test-{label}-{:?}",
            std::time::Instant::now()
        ));
        dir
    }

    #[test]
    fn missing_key_returns_none() {
        let storage = FileStorage::new(temp_dir("missing"));
        assert!(storage.load("audio").unwrap().is_none());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let storage = FileStorage::new(temp_dir("roundtrip"));
        storage.save("audio", b"hello").unwrap();
        assert_eq!(storage.load("audio").unwrap().unwrap(), b"hello");
        storage.erase_all().unwrap();
    }

    #[test]
    fn erase_all_clears_every_key() {
        let storage = FileStorage::new(temp_dir("erase"));
        storage.save("audio", b"a").unwrap();
        storage.save("bpm", b"b").unwrap();
        storage.erase_all().unwrap();
        assert!(storage.load("audio").unwrap().is_none());
        assert!(storage.load("bpm").unwrap().is_none());
    }

    #[test]
    fn overwrite_replaces_previous_value() {
        let storage = FileStorage::new(temp_dir("overwrite"));
        storage.save("audio", b"first").unwrap();
        storage.save("audio", b"second").unwrap();
        assert_eq!(storage.load("audio").unwrap().unwrap(), b"second");
        storage.erase_all().unwrap();
    }
}
