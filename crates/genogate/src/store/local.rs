use std::fs::{self, File, Metadata};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use super::{ExternalStore, FileStatus};
use crate::error::StoreError;

/// [`ExternalStore`] backed by a local directory tree.
///
/// Store path `/a/b` lives at `<root>/a/b`; a relative path `x` used by `alice` lives at
/// `<root>/<home_prefix>/alice/x`.
///
/// Anyone may read anywhere under the root, but writes are confined to the caller's home
/// directory. Deleting or moving the home directory itself is refused as well.
pub struct LocalStore {
    root: PathBuf,
    home_prefix: Vec<String>,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(root: P, home_prefix: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            home_prefix: home_prefix
                .split('/')
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    fn components(&self, path: &str, owner: &str) -> Result<Vec<String>, StoreError> {
        let invalid = |reason: &str| StoreError::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(invalid("path is empty"));
        }

        let mut components = Vec::new();
        if !trimmed.starts_with('/') {
            if owner.is_empty() || owner.contains('/') || owner == "." || owner == ".." {
                return Err(invalid("cannot resolve a relative path for this user"));
            }
            components.extend(self.home_prefix.iter().cloned());
            components.push(owner.to_string());
        }

        for component in trimmed.split('/') {
            match component {
                "" | "." => continue,
                ".." => return Err(invalid("path traversal (..) is not allowed")),
                c if c.contains('\0') => return Err(invalid("path contains a NUL byte")),
                c => components.push(c.to_string()),
            }
        }

        Ok(components)
    }

    fn resolve(&self, path: &str, owner: &str) -> Result<(String, PathBuf), StoreError> {
        let components = self.components(path, owner)?;
        let qualified = format!("/{}", components.join("/"));
        let mut local = self.root.clone();
        local.extend(components);
        Ok((qualified, local))
    }

    /// Resolves a path the caller is about to modify.
    fn resolve_writable(
        &self,
        path: &str,
        owner: &str,
        allow_home: bool,
    ) -> Result<(String, PathBuf), StoreError> {
        let components = self.components(path, owner)?;
        let qualified = format!("/{}", components.join("/"));

        let home_len = self.home_prefix.len() + 1;
        let in_home = components.len() >= home_len
            && components[..self.home_prefix.len()] == self.home_prefix[..]
            && components[self.home_prefix.len()] == owner;
        if !in_home || (!allow_home && components.len() == home_len) {
            return Err(StoreError::PermissionDenied(qualified));
        }

        let mut local = self.root.clone();
        local.extend(components);
        Ok((qualified, local))
    }

    fn status(&self, qualified: String, metadata: &Metadata) -> FileStatus {
        let modification_time = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let (owner, group, permission, block_size) = platform_attributes(metadata);

        FileStatus {
            is_dir: metadata.is_dir(),
            path: qualified,
            owner,
            group,
            permission,
            replication: 1,
            modification_time,
            block_size,
            length: if metadata.is_dir() { 0 } else { metadata.len() },
        }
    }
}

#[cfg(unix)]
fn platform_attributes(metadata: &Metadata) -> (String, String, String, u64) {
    use std::os::unix::fs::MetadataExt;
    (
        metadata.uid().to_string(),
        metadata.gid().to_string(),
        render_permission(metadata.mode()),
        metadata.blksize(),
    )
}

#[cfg(not(unix))]
fn platform_attributes(metadata: &Metadata) -> (String, String, String, u64) {
    let mode = if metadata.permissions().readonly() {
        0o444
    } else {
        0o666
    };
    (
        "unknown".to_string(),
        "unknown".to_string(),
        render_permission(mode),
        4096,
    )
}

/// Renders the low nine mode bits as `rwxr-xr-x`.
pub fn render_permission(mode: u32) -> String {
    const FLAGS: [char; 3] = ['r', 'w', 'x'];
    (0..9)
        .map(|i| {
            if mode & (0o400 >> i) != 0 {
                FLAGS[i % 3]
            } else {
                '-'
            }
        })
        .collect()
}

/// `rename` first, then copy and delete for files that cannot be renamed in place.
fn move_entry(src: &Path, dst: &Path) -> std::io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if src.is_dir() => Err(e),
        Err(_) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)
        }
    }
}

impl ExternalStore for LocalStore {
    fn create(&self, path: &str, owner: &str) -> Result<Box<dyn Write + Send>, StoreError> {
        let (qualified, local) = self.resolve_writable(path, owner, false)?;

        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::from_io(&qualified, e))?;
        }
        if local.is_dir() {
            return Err(StoreError::InvalidPath {
                path: qualified,
                reason: "is a directory".to_string(),
            });
        }

        let file = File::create(&local).map_err(|e| StoreError::from_io(&qualified, e))?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn open(&self, path: &str, owner: &str) -> Result<Box<dyn Read + Send>, StoreError> {
        let (qualified, local) = self.resolve(path, owner)?;

        let metadata = fs::metadata(&local).map_err(|e| StoreError::from_io(&qualified, e))?;
        if metadata.is_dir() {
            return Err(StoreError::InvalidPath {
                path: qualified,
                reason: "is a directory".to_string(),
            });
        }

        let file = File::open(&local).map_err(|e| StoreError::from_io(&qualified, e))?;
        Ok(Box::new(file))
    }

    fn list_status(&self, path: &str, owner: &str) -> Result<Vec<FileStatus>, StoreError> {
        let (qualified, local) = self.resolve(path, owner)?;

        let metadata = fs::metadata(&local).map_err(|e| StoreError::from_io(&qualified, e))?;
        if !metadata.is_dir() {
            return Ok(vec![self.status(qualified, &metadata)]);
        }

        let entries = fs::read_dir(&local).map_err(|e| StoreError::from_io(&qualified, e))?;
        let mut statuses = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::from_io(&qualified, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let child = if qualified == "/" {
                format!("/{}", name)
            } else {
                format!("{}/{}", qualified, name)
            };
            let metadata = entry
                .metadata()
                .map_err(|e| StoreError::from_io(&child, e))?;
            statuses.push(self.status(child, &metadata));
        }
        statuses.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(statuses)
    }

    fn delete(&self, path: &str, recursive: bool, owner: &str) -> Result<bool, StoreError> {
        let (qualified, local) = self.resolve_writable(path, owner, false)?;

        let metadata = match fs::symlink_metadata(&local) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(StoreError::from_io(&qualified, e)),
        };

        let result = if metadata.is_dir() {
            if recursive {
                fs::remove_dir_all(&local)
            } else {
                let mut entries =
                    fs::read_dir(&local).map_err(|e| StoreError::from_io(&qualified, e))?;
                if entries.next().is_some() {
                    return Err(StoreError::DirectoryNotEmpty(qualified));
                }
                fs::remove_dir(&local)
            }
        } else {
            fs::remove_file(&local)
        };

        result.map_err(|e| StoreError::from_io(&qualified, e))?;
        Ok(true)
    }

    fn mkdirs(&self, path: &str, owner: &str) -> Result<bool, StoreError> {
        let (qualified, local) = self.resolve_writable(path, owner, true)?;

        if local.exists() && !local.is_dir() {
            return Err(StoreError::InvalidPath {
                path: qualified,
                reason: "a file already exists at this path".to_string(),
            });
        }

        fs::create_dir_all(&local).map_err(|e| StoreError::from_io(&qualified, e))?;
        Ok(true)
    }

    fn rename(&self, src: &str, dst: &str, owner: &str) -> Result<bool, StoreError> {
        let (src_qualified, src_local) = self.resolve_writable(src, owner, false)?;
        let (dst_qualified, mut dst_local) = self.resolve_writable(dst, owner, true)?;

        if !src_local.exists() {
            return Ok(false);
        }

        // Moving onto an existing directory moves the source into it.
        if dst_local.is_dir() {
            match src_local.file_name() {
                Some(name) => dst_local.push(name),
                None => return Ok(false),
            }
        }

        if dst_local.exists() || dst_local.starts_with(&src_local) {
            return Ok(false);
        }
        match dst_local.parent() {
            Some(parent) if parent.is_dir() => {}
            _ => return Ok(false),
        }

        move_entry(&src_local, &dst_local).map_err(|e| {
            StoreError::from_io(&format!("{} -> {}", src_qualified, dst_qualified), e)
        })?;
        Ok(true)
    }

    fn exists(&self, path: &str, owner: &str) -> Result<bool, StoreError> {
        let (_, local) = self.resolve(path, owner)?;
        Ok(local.exists())
    }

    fn qualify(&self, path: &str, owner: &str) -> Result<String, StoreError> {
        self.components(path, owner)
            .map(|c| format!("/{}", c.join("/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, LocalStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path(), "user");
        (dir, store)
    }

    #[test]
    fn test_qualify_relative_and_absolute() {
        let (_dir, store) = store();
        assert_eq!(store.qualify("reads.pe", "alice").unwrap(), "/user/alice/reads.pe");
        assert_eq!(store.qualify("out/./align1", "alice").unwrap(), "/user/alice/out/align1");
        assert_eq!(store.qualify("/genomes//hg19", "alice").unwrap(), "/genomes/hg19");
    }

    #[test]
    fn test_rejects_traversal_and_empty() {
        let (_dir, store) = store();
        assert!(matches!(
            store.qualify("../bob/secret", "alice"),
            Err(StoreError::InvalidPath { .. })
        ));
        assert!(matches!(
            store.qualify("/user/../etc", "alice"),
            Err(StoreError::InvalidPath { .. })
        ));
        assert!(matches!(
            store.qualify("  ", "alice"),
            Err(StoreError::InvalidPath { .. })
        ));
        assert!(matches!(
            store.qualify("x", "../root"),
            Err(StoreError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_create_then_open() {
        let (dir, store) = store();
        {
            let mut writer = store.create("data/a.txt", "alice").unwrap();
            writer.write_all(b"hello").unwrap();
            writer.flush().unwrap();
        }
        assert!(dir.path().join("user/alice/data/a.txt").exists());

        let mut reader = store.open("/user/alice/data/a.txt", "bob").unwrap();
        let mut content = String::new();
        reader.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.open("nope", "alice"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_status_directory_and_file() {
        let (dir, store) = store();
        let home = dir.path().join("user/alice");
        fs::create_dir_all(home.join("sub")).unwrap();
        fs::write(home.join("b.vcf"), b"12345").unwrap();

        let statuses = store.list_status(".", "alice").unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].path, "/user/alice/b.vcf");
        assert!(!statuses[0].is_dir);
        assert_eq!(statuses[0].length, 5);
        assert_eq!(statuses[0].replication, 1);
        assert_eq!(statuses[0].permission.len(), 9);
        assert_eq!(statuses[1].path, "/user/alice/sub");
        assert!(statuses[1].is_dir);
        assert_eq!(statuses[1].length, 0);

        let single = store.list_status("b.vcf", "alice").unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].path, "/user/alice/b.vcf");
    }

    #[test]
    fn test_delete_non_recursive_on_non_empty_dir() {
        let (dir, store) = store();
        let target = dir.path().join("user/alice/keep");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("f"), b"x").unwrap();

        let err = store.delete("keep", false, "alice").unwrap_err();
        assert!(matches!(err, StoreError::DirectoryNotEmpty(_)));
        assert!(target.join("f").exists());

        assert!(store.delete("keep", true, "alice").unwrap());
        assert!(!target.exists());
        assert!(!store.delete("keep", true, "alice").unwrap());
    }

    #[test]
    fn test_delete_root_is_denied() {
        let (_dir, store) = store();
        assert!(matches!(
            store.delete("/", true, "alice"),
            Err(StoreError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_writes_outside_home_are_denied() {
        let (dir, store) = store();
        fs::create_dir_all(dir.path().join("user/bob")).unwrap();
        fs::write(dir.path().join("user/bob/results.vcf"), b"x").unwrap();
        fs::create_dir_all(dir.path().join("genomes/hg19")).unwrap();

        for target in ["/user/bob", "/user/bob/results.vcf", "/genomes", "/user"] {
            assert!(
                matches!(
                    store.delete(target, true, "alice"),
                    Err(StoreError::PermissionDenied(_))
                ),
                "{}",
                target
            );
        }
        assert!(matches!(
            store.create("/user/bob/planted.txt", "alice"),
            Err(StoreError::PermissionDenied(_))
        ));
        assert!(matches!(
            store.mkdirs("/genomes/mine", "alice"),
            Err(StoreError::PermissionDenied(_))
        ));
        assert!(matches!(
            store.rename("/user/bob/results.vcf", "stolen.vcf", "alice"),
            Err(StoreError::PermissionDenied(_))
        ));
        assert!(matches!(
            store.rename("/user/alice", "/user/alice2", "alice"),
            Err(StoreError::PermissionDenied(_))
        ));
        assert!(dir.path().join("user/bob/results.vcf").exists());
        assert!(dir.path().join("genomes/hg19").is_dir());

        // absolute paths inside one's own home are fine
        assert!(store.mkdirs("/user/alice/runs", "alice").unwrap());
        assert!(store.delete("/user/alice/runs", false, "alice").unwrap());
        assert!(matches!(
            store.delete("/user/alice", true, "alice"),
            Err(StoreError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_mkdirs_and_exists() {
        let (_dir, store) = store();
        assert!(!store.exists("a/b/c", "alice").unwrap());
        assert!(store.mkdirs("a/b/c", "alice").unwrap());
        assert!(store.exists("/user/alice/a/b/c", "bob").unwrap());
    }

    #[test]
    fn test_rename_semantics() {
        let (dir, store) = store();
        let home = dir.path().join("user/alice");
        fs::create_dir_all(home.join("dest")).unwrap();
        fs::write(home.join("one.sam"), b"1").unwrap();
        fs::write(home.join("two.sam"), b"2").unwrap();

        assert!(!store.rename("missing", "x", "alice").unwrap());
        assert!(store.rename("one.sam", "renamed.sam", "alice").unwrap());
        assert!(home.join("renamed.sam").exists());

        // existing destination file is not overwritten
        assert!(!store.rename("two.sam", "renamed.sam", "alice").unwrap());

        // moving onto a directory moves into it
        assert!(store.rename("two.sam", "dest", "alice").unwrap());
        assert!(home.join("dest/two.sam").exists());

        // missing destination parent
        assert!(!store.rename("renamed.sam", "no/such/place", "alice").unwrap());
    }

    #[test]
    fn test_render_permission() {
        assert_eq!(render_permission(0o755), "rwxr-xr-x");
        assert_eq!(render_permission(0o640), "rw-r-----");
        assert_eq!(render_permission(0o100644), "rw-r--r--");
    }
}
