//! Durable per-tablet consensus metadata: current term, vote, and the
//! committed/pending configs. Every externally-visible action predicated on
//! this state (vote grants, term advances, config commits) persists first.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use prost::Message;

use crate::errors::ProstError;
use crate::errors::StorageError;
use crate::errors::SystemError;
use crate::proto::ConsensusMetaDoc;
use crate::Result;

#[cfg_attr(test, automock)]
pub trait MetaStore: Send + Sync + 'static {
    fn load(&self) -> Result<Option<ConsensusMetaDoc>>;

    fn save(
        &self,
        doc: &ConsensusMetaDoc,
    ) -> Result<()>;
}

/// Volatile store for tests and embedders that persist elsewhere.
#[derive(Default)]
pub struct InMemMetaStore {
    doc: Mutex<Option<ConsensusMetaDoc>>,
}

impl MetaStore for InMemMetaStore {
    fn load(&self) -> Result<Option<ConsensusMetaDoc>> {
        Ok(self.doc.lock().clone())
    }

    fn save(
        &self,
        doc: &ConsensusMetaDoc,
    ) -> Result<()> {
        *self.doc.lock() = Some(doc.clone());
        Ok(())
    }
}

/// Prost-encoded single-file store. Writes go to a sibling temp file first
/// and land with an atomic rename, so a torn write never corrupts the
/// previous document.
pub struct FileMetaStore {
    path: PathBuf,
}

impl FileMetaStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store rooted in a tablet directory, using the conventional file name.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(crate::constants::CONSENSUS_META_FILENAME))
    }

    fn tmp_path(&self) -> PathBuf {
        let mut path = self.path.clone();
        path.set_extension("tmp");
        path
    }
}

impl MetaStore for FileMetaStore {
    fn load(&self) -> Result<Option<ConsensusMetaDoc>> {
        if !Path::exists(&self.path) {
            return Ok(None);
        }
        let bytes =
            fs::read(&self.path).map_err(|e| SystemError::Storage(StorageError::Io(e)))?;
        let doc = ConsensusMetaDoc::decode(bytes.as_slice())
            .map_err(|e| SystemError::Storage(StorageError::Prost(ProstError::Decode(e))))?;
        Ok(Some(doc))
    }

    fn save(
        &self,
        doc: &ConsensusMetaDoc,
    ) -> Result<()> {
        let bytes = doc.encode_to_vec();
        let tmp = self.tmp_path();
        fs::write(&tmp, &bytes).map_err(|e| SystemError::Storage(StorageError::Io(e)))?;
        fs::rename(&tmp, &self.path).map_err(|e| SystemError::Storage(StorageError::Io(e)))?;
        Ok(())
    }
}

/// Shared handle alias used where the store is passed across tasks.
pub type SharedMetaStore = Arc<dyn MetaStore>;
