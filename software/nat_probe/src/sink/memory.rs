use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use super::store::{CancelToken, ObjectStore, UploadError};

/// In-process object store.
///
/// Clones share the same objects, so a caller can keep one handle
/// to inspect what the server stored through another.
#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct MemoryStore {
    #[serde(skip)]
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }

    /// Snapshot of every stored object, ordered by key
    pub fn objects(&self) -> Vec<(String, Vec<u8>)> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[typetag::serde]
impl ObjectStore for MemoryStore {
    fn put(&self, key: &str, body: &[u8], cancel: &CancelToken) -> Result<(), UploadError> {
        cancel.check(key)?;
        let mut objects = self.lock();
        if objects.contains_key(key) {
            return Err(UploadError::AlreadyExists {
                key: key.to_owned(),
            });
        }
        objects.insert(key.to_owned(), body.to_vec());
        Ok(())
    }
}
