//! A pathlib-style handle to a path on the remote filesystem.
//!
//! Metadata is lazy: the first query that needs it costs one `stat`, and a
//! not-found answer is cached as "absent". Directory listings eagerly
//! populate the children's type and size so glob traversal never re-stats.

use std::sync::Arc;

use crate::facade::{FacadeClient, FileType};
use crate::{FacadeResult, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeCache {
    Unknown,
    Absent,
    Known(FileType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeCache {
    Unknown,
    Absent,
    Known(u64),
}

#[derive(Clone)]
pub struct RemotePath {
    facade: Arc<dyn FacadeClient>,
    machine: String,
    sep: char,
    path: String,
    ftype: TypeCache,
    fsize: SizeCache,
}

impl std::fmt::Debug for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RemotePath({}@{})", self.machine, self.path)
    }
}

impl RemotePath {
    /// A path with unknown metadata.
    pub fn new(
        facade: Arc<dyn FacadeClient>,
        machine: impl Into<String>,
        path: impl Into<String>,
        sep: char,
    ) -> Self {
        Self {
            facade,
            machine: machine.into(),
            sep,
            path: path.into(),
            ftype: TypeCache::Unknown,
            fsize: SizeCache::Unknown,
        }
    }

    /// A path whose type and size are already known, e.g. a directory the
    /// caller just created.
    pub fn with_metadata(
        facade: Arc<dyn FacadeClient>,
        machine: impl Into<String>,
        path: impl Into<String>,
        sep: char,
        file_type: FileType,
        size: u64,
    ) -> Self {
        Self {
            facade,
            machine: machine.into(),
            sep,
            path: path.into(),
            ftype: TypeCache::Known(file_type),
            fsize: SizeCache::Known(size),
        }
    }

    /// Full path as a string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Final path component.
    pub fn name(&self) -> &str {
        self.path.rsplit(self.sep).next().unwrap_or(&self.path)
    }

    /// Join parts onto this path; the result has unknown metadata.
    pub fn joinpath(&self, parts: &[&str]) -> RemotePath {
        let mut path = self.path.clone();
        for part in parts {
            if !path.ends_with(self.sep) {
                path.push(self.sep);
            }
            path.push_str(part);
        }
        RemotePath::new(self.facade.clone(), self.machine.clone(), path, self.sep)
    }

    /// This path relative to `root`, `/`-joined regardless of the remote
    /// separator. `None` when the path is not under `root`.
    pub fn relative_posix(&self, root: &str) -> Option<String> {
        let root = root.trim_end_matches(self.sep);
        let rest = self.path.strip_prefix(root)?;
        let rest = rest.strip_prefix(self.sep)?;
        Some(
            rest.split(self.sep)
                .collect::<Vec<_>>()
                .join("/"),
        )
    }

    /// File type when already known; `None` when absent or never fetched.
    pub fn known_type(&self) -> Option<FileType> {
        match self.ftype {
            TypeCache::Known(t) => Some(t),
            _ => None,
        }
    }

    /// Size in bytes, `None` if the path does not exist.
    pub async fn size(&mut self) -> FacadeResult<Option<u64>> {
        if let SizeCache::Unknown = self.fsize {
            match self.facade.stat(&self.machine, &self.path).await {
                Ok(stat) => self.fsize = SizeCache::Known(stat.size),
                Err(TransportError::NotFound(_)) => {
                    self.fsize = SizeCache::Absent;
                    self.ftype = TypeCache::Absent;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(match self.fsize {
            SizeCache::Known(size) => Some(size),
            _ => None,
        })
    }

    pub async fn exists(&mut self) -> FacadeResult<bool> {
        Ok(self.size().await?.is_some())
    }

    async fn file_type(&mut self) -> FacadeResult<Option<FileType>> {
        match self.ftype {
            TypeCache::Known(t) => Ok(Some(t)),
            TypeCache::Absent => Ok(None),
            TypeCache::Unknown => {
                if self.size().await?.is_none() {
                    self.ftype = TypeCache::Absent;
                    return Ok(None);
                }
                // stat reports size but not type; only listings carry types
                Err(TransportError::Protocol(format!(
                    "file type of {} is not known from stat",
                    self.path
                )))
            }
        }
    }

    pub async fn is_symlink(&mut self) -> FacadeResult<bool> {
        Ok(self.file_type().await? == Some(FileType::Symlink))
    }

    pub async fn is_dir(&mut self) -> FacadeResult<bool> {
        match self.file_type().await? {
            Some(FileType::Symlink) => Err(TransportError::Protocol(format!(
                "symlink targets are not resolved: {}",
                self.path
            ))),
            t => Ok(t == Some(FileType::Directory)),
        }
    }

    pub async fn is_file(&mut self) -> FacadeResult<bool> {
        match self.file_type().await? {
            Some(FileType::Symlink) => Err(TransportError::Protocol(format!(
                "symlink targets are not resolved: {}",
                self.path
            ))),
            t => Ok(t == Some(FileType::Regular)),
        }
    }

    /// List this directory, children carrying eager type and size.
    pub async fn iterdir(&self) -> FacadeResult<Vec<RemotePath>> {
        let entries = self
            .facade
            .list_files(&self.machine, &self.path, true)
            .await?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let mut child = self.joinpath(&[entry.name.as_str()]);
                child.ftype = TypeCache::Known(entry.file_type);
                child.fsize = SizeCache::Known(entry.size);
                child
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFacade;

    fn remote() -> (Arc<MockFacade>, Arc<dyn FacadeClient>) {
        let mock = MockFacade::shared();
        let facade: Arc<dyn FacadeClient> = mock.clone();
        (mock, facade)
    }

    #[tokio::test]
    async fn stat_is_lazy_and_absent_is_cached() {
        let (mock, facade) = remote();
        mock.put_dir("/work");
        mock.put_file("/work/a.txt", b"abc");

        let mut path = RemotePath::new(facade.clone(), "machine", "/work/a.txt", '/');
        assert_eq!(mock.counters().stats, 0);
        assert_eq!(path.size().await.unwrap(), Some(3));
        assert_eq!(path.size().await.unwrap(), Some(3));
        assert_eq!(mock.counters().stats, 1);

        let mut gone = RemotePath::new(facade, "machine", "/work/missing", '/');
        assert!(!gone.exists().await.unwrap());
        assert!(!gone.exists().await.unwrap());
        assert_eq!(mock.counters().stats, 2);
    }

    #[tokio::test]
    async fn iterdir_children_carry_types_and_sizes() {
        let (mock, facade) = remote();
        mock.put_dir("/work/sub");
        mock.put_file("/work/a.txt", b"abc");

        let root = RemotePath::with_metadata(
            facade,
            "machine",
            "/work",
            '/',
            FileType::Directory,
            0,
        );
        let mut children = root.iterdir().await.unwrap();
        children.sort_by(|a, b| a.path().cmp(b.path()));
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].path(), "/work/a.txt");
        assert_eq!(children[0].known_type(), Some(FileType::Regular));
        assert_eq!(children[1].known_type(), Some(FileType::Directory));
        // no stat was needed for any of this
        assert_eq!(mock.counters().stats, 0);
    }

    #[tokio::test]
    async fn relative_posix_strips_the_root() {
        let (_, facade) = remote();
        let path = RemotePath::new(facade, "machine", "/work/flows/u1/out/data.txt", '/');
        assert_eq!(
            path.relative_posix("/work/flows/u1"),
            Some("out/data.txt".to_string())
        );
        assert_eq!(path.relative_posix("/elsewhere"), None);
    }

    #[tokio::test]
    async fn joinpath_never_touches_the_network() {
        let (mock, facade) = remote();
        let base = RemotePath::new(facade, "machine", "/work", '/');
        let joined = base.joinpath(&["a", "b.txt"]);
        assert_eq!(joined.path(), "/work/a/b.txt");
        assert_eq!(mock.counters().stats, 0);
        assert_eq!(mock.counters().lists, 0);
    }
}
