use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::pdb::models::ProfileId;

/// Layout of the JSON documents stored beside the database:
/// `typing/{id}_typing.json`, `comments/{id}_comments.json`, `wiki/{id}_wiki.json`.
#[derive(Debug, Clone)]
pub struct DocumentDir {
    root: PathBuf,
}

impl DocumentDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn typing_path(&self, id: ProfileId) -> PathBuf {
        self.root.join("typing").join(format!("{id}_typing.json"))
    }

    pub fn comments_path(&self, id: ProfileId) -> PathBuf {
        self.root.join("comments").join(format!("{id}_comments.json"))
    }

    pub fn wiki_path(&self, id: ProfileId) -> PathBuf {
        self.root.join("wiki").join(format!("{id}_wiki.json"))
    }
}

/// Pretty-print `value` to `path` through a sibling temp file and a rename, so
/// readers never see a half-written document. Overwrites any previous version.
pub async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StorageError> {
    let body = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(parent, e))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, &body)
        .await
        .map_err(|e| StorageError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StorageError::io(path, e))
}

pub async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StorageError> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    Ok(serde_json::from_slice(&raw)?)
}
