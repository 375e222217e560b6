//! Access to resource content.
//!
//! Resources are addressed by id (the path relative to the target root). Writes are
//! atomic: content goes to a temporary file in the same directory, then is renamed
//! over the target.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use shepherd_core::{Error, ResourceId, Result};

pub trait Workspace: Send + Sync {
    /// Current content, or `None` if the resource does not exist.
    fn read(&self, resource: &ResourceId) -> Result<Option<Vec<u8>>>;

    fn write(&self, resource: &ResourceId, content: &[u8]) -> Result<()>;

    /// Delete the resource. Missing resources are not an error.
    fn remove(&self, resource: &ResourceId) -> Result<()>;
}

/// Files under a root directory.
#[derive(Debug, Clone)]
pub struct FsWorkspace {
    root: PathBuf,
}

impl FsWorkspace {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, resource: &ResourceId) -> Result<PathBuf> {
        let rel = Path::new(resource.as_str());
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::Storage(format!(
                "resource '{}' escapes the workspace root",
                resource
            )));
        }
        Ok(self.root.join(rel))
    }
}

impl Workspace for FsWorkspace {
    fn read(&self, resource: &ResourceId) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_of(resource)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, resource: &ResourceId, content: &[u8]) -> Result<()> {
        let path = self.path_of(resource)?;
        let dir = path
            .parent()
            .ok_or_else(|| Error::Storage(format!("resource '{}' has no parent", resource)))?;
        std::fs::create_dir_all(dir)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        std::fs::write(&tmp, content)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn remove(&self, resource: &ResourceId) -> Result<()> {
        match std::fs::remove_file(self.path_of(resource)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Map-backed workspace for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryWorkspace {
    files: Mutex<BTreeMap<ResourceId, Vec<u8>>>,
}

impl InMemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files<'a>(files: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Self {
        Self {
            files: Mutex::new(
                files
                    .into_iter()
                    .map(|(id, content)| (ResourceId::from(id), content.to_vec()))
                    .collect(),
            ),
        }
    }

    pub fn get(&self, resource: &str) -> Option<Vec<u8>> {
        self.files.lock().get(&ResourceId::from(resource)).cloned()
    }
}

impl Workspace for InMemoryWorkspace {
    fn read(&self, resource: &ResourceId) -> Result<Option<Vec<u8>>> {
        Ok(self.files.lock().get(resource).cloned())
    }

    fn write(&self, resource: &ResourceId, content: &[u8]) -> Result<()> {
        self.files.lock().insert(resource.clone(), content.to_vec());
        Ok(())
    }

    fn remove(&self, resource: &ResourceId) -> Result<()> {
        self.files.lock().remove(resource);
        Ok(())
    }
}
