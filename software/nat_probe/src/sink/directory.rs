//! Object store backed by a local directory tree.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::store::{CancelToken, ObjectStore, UploadError};

/// Writes each object to `{root}/{key}`, with `/`-separated key segments
/// mapped to directories.
///
/// Objects are written to a `.partial` file first and renamed into place,
/// so a reader never sees a half-written record. Existing objects are
/// never replaced.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the object with this key
    pub fn path_for(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

#[typetag::serde]
impl ObjectStore for DirectoryStore {
    fn put(&self, key: &str, body: &[u8], cancel: &CancelToken) -> Result<(), UploadError> {
        let io_err = |source: std::io::Error| UploadError::Io {
            key: key.to_owned(),
            source,
        };

        cancel.check(key)?;

        let path = self.path_for(key);
        if path.exists() {
            return Err(UploadError::AlreadyExists {
                key: key.to_owned(),
            });
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }

        let mut partial = path.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let result = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&partial)
            .and_then(|mut file| {
                file.write_all(body)?;
                file.sync_all()
            })
            .map_err(io_err)
            .and_then(|()| cancel.check(key))
            .and_then(|()| fs::rename(&partial, &path).map_err(io_err));

        if result.is_err() {
            let _ = fs::remove_file(&partial);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nat_probe_{name}_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn writes_nested_objects() {
        let root = scratch_dir("dir_store");
        let store = DirectoryStore::new(&root);

        let key = "prefix/raw/2020/01/02/03/10.0.0.1:5000-030405-id.json";
        store.put(key, b"{}", &CancelToken::new()).unwrap();

        let path = store.path_for(key);
        assert!(path.starts_with(&root));
        assert_eq!(fs::read(&path).unwrap(), b"{}");

        // No temporary file left behind
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn never_overwrites() {
        let root = scratch_dir("dir_store_append");
        let store = DirectoryStore::new(&root);

        store.put("a/b.json", b"first", &CancelToken::new()).unwrap();
        let err = store.put("a/b.json", b"second", &CancelToken::new()).unwrap_err();
        assert!(matches!(err, UploadError::AlreadyExists { .. }));
        assert_eq!(fs::read(store.path_for("a/b.json")).unwrap(), b"first");

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn cancelled_upload_leaves_nothing() {
        let root = scratch_dir("dir_store_cancel");
        let store = DirectoryStore::new(&root);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = store.put("a/b.json", b"{}", &cancel).unwrap_err();
        assert!(matches!(err, UploadError::Cancelled { .. }));
        assert!(!store.path_for("a/b.json").exists());

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn keys_stay_under_root() {
        let store = DirectoryStore::new("/srv/logs");
        assert_eq!(
            store.path_for("../../etc/./passwd"),
            PathBuf::from("/srv/logs/etc/passwd")
        );
    }
}
