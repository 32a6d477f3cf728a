//! Stateless directory operations.

use std::sync::Arc;

use crate::auth::Principal;
use crate::error::Result;
use crate::store::{ExternalStore, FileStatus};

pub struct DirectoryGateway {
    store: Arc<dyn ExternalStore>,
}

impl DirectoryGateway {
    pub fn new(store: Arc<dyn ExternalStore>) -> Self {
        Self { store }
    }

    pub fn list_status(&self, path: &str, principal: &Principal) -> Result<Vec<FileStatus>> {
        let statuses = self.store.list_status(path, &principal.username)?;
        log::debug!(
            "{} listed {} ({} entries)",
            principal.username,
            path,
            statuses.len()
        );
        Ok(statuses)
    }

    /// Deletes `path`. A non-recursive delete of a non-empty directory fails and leaves it intact.
    pub fn remove(&self, path: &str, recursive: bool, principal: &Principal) -> Result<bool> {
        let removed = self
            .store
            .delete(path, recursive, &principal.username)?;
        log::info!(
            "{} removed {} (recursive={}, existed={})",
            principal.username,
            path,
            recursive,
            removed
        );
        Ok(removed)
    }

    pub fn mkdir(&self, path: &str, principal: &Principal) -> Result<bool> {
        let created = self
            .store
            .mkdirs(path, &principal.username)?;
        log::info!("{} created directory {}", principal.username, path);
        Ok(created)
    }

    pub fn mv(&self, src: &str, dst: &str, principal: &Principal) -> Result<bool> {
        let moved = self
            .store
            .rename(src, dst, &principal.username)?;
        log::info!(
            "{} moved {} -> {} (moved={})",
            principal.username,
            src,
            dst,
            moved
        );
        Ok(moved)
    }

    pub fn check_file_status(&self, path: &str, principal: &Principal) -> Result<bool> {
        Ok(self.store.exists(path, &principal.username)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, StoreError};
    use crate::store::LocalStore;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    type StoreResult<T> = std::result::Result<T, StoreError>;

    /// Store whose entries disappear between the caller's check and the operation.
    struct RacingStore;

    impl ExternalStore for RacingStore {
        fn create(&self, path: &str, _: &str) -> StoreResult<Box<dyn Write + Send>> {
            Err(StoreError::NotFound(path.to_string()))
        }
        fn open(&self, path: &str, _: &str) -> StoreResult<Box<dyn Read + Send>> {
            Err(StoreError::NotFound(path.to_string()))
        }
        fn list_status(&self, path: &str, _: &str) -> StoreResult<Vec<FileStatus>> {
            Err(StoreError::NotFound(path.to_string()))
        }
        fn delete(&self, path: &str, _: bool, _: &str) -> StoreResult<bool> {
            Err(StoreError::NotFound(path.to_string()))
        }
        fn mkdirs(&self, path: &str, _: &str) -> StoreResult<bool> {
            Err(StoreError::NotFound(path.to_string()))
        }
        fn rename(&self, src: &str, _: &str, _: &str) -> StoreResult<bool> {
            Err(StoreError::NotFound(src.to_string()))
        }
        fn exists(&self, path: &str, _: &str) -> StoreResult<bool> {
            Err(StoreError::PermissionDenied(path.to_string()))
        }
        fn qualify(&self, path: &str, _: &str) -> StoreResult<String> {
            Ok(path.to_string())
        }
    }

    fn gateway() -> (TempDir, DirectoryGateway) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(dir.path(), "user"));
        (dir, DirectoryGateway::new(store))
    }

    #[test]
    fn test_mkdir_list_remove() {
        let (_dir, gw) = gateway();
        let p = Principal::new("alice");

        assert!(gw.mkdir("runs/1", &p).unwrap());
        assert!(gw.check_file_status("runs/1", &p).unwrap());

        let listing = gw.list_status("runs", &p).unwrap();
        assert_eq!(listing.len(), 1);
        assert!(listing[0].is_dir);
        assert_eq!(listing[0].path, "/user/alice/runs/1");

        let err = gw.remove("runs", false, &p).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(gw.check_file_status("runs/1", &p).unwrap());

        assert!(gw.remove("runs", true, &p).unwrap());
        assert!(!gw.check_file_status("runs", &p).unwrap());
    }

    #[test]
    fn test_list_missing_is_not_found() {
        let (_dir, gw) = gateway();
        let err = gw.list_status("ghost", &Principal::new("alice")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_mv() {
        let (dir, gw) = gateway();
        let p = Principal::new("alice");
        std::fs::create_dir_all(dir.path().join("user/alice")).unwrap();
        std::fs::write(dir.path().join("user/alice/a.vcf"), b"v").unwrap();

        assert!(gw.mv("a.vcf", "b.vcf", &p).unwrap());
        assert!(!gw.check_file_status("a.vcf", &p).unwrap());
        assert!(gw.check_file_status("b.vcf", &p).unwrap());
        assert!(!gw.mv("a.vcf", "c.vcf", &p).unwrap());
    }

    #[test]
    fn test_store_error_kinds_are_kept() {
        let gw = DirectoryGateway::new(Arc::new(RacingStore));
        let p = Principal::new("alice");

        let err = gw.remove("gone", true, &p).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("gone"), "{}", err);
        assert_eq!(gw.mkdir("gone/sub", &p).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(gw.mv("gone", "there", &p).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(gw.check_file_status("x", &p).unwrap_err().kind(), ErrorKind::Io);
    }

    #[test]
    fn test_writes_into_another_home_are_io_errors() {
        let (dir, gw) = gateway();
        std::fs::create_dir_all(dir.path().join("user/bob/keep")).unwrap();

        let err = gw.remove("/user/bob/keep", true, &Principal::new("alice")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("Permission denied"), "{}", err);
        assert!(dir.path().join("user/bob/keep").is_dir());
    }
}
