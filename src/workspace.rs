//! Per-request workspaces. Each execution gets a fresh directory named after
//! its request id; dropping the [`Workspace`] tears it down.

use crate::config::Isolation;
use crate::error::{Error, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const BIND_DIRS: [&str; 5] = ["/bin", "/lib", "/lib64", "/usr", "/etc"];
const DEVICES: [&str; 4] = ["null", "zero", "urandom", "random"];

/// Directory the program runs in when chrooted.
const CHROOT_HOME: &str = "/home";

#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    isolation: Isolation,
}

impl Workspace {
    /// Create `<base>/<request_id>`. Fails if the directory already exists.
    pub fn create(base: &Path, request_id: &str, isolation: Isolation) -> Result<Self> {
        if request_id.is_empty() || request_id.contains('/') || request_id.starts_with('.') {
            return Err(Error::Setup(format!("bad workspace name: {:?}", request_id)));
        }
        fs::create_dir_all(base).map_err(|e| Error::setup("mkdir workspace root", e))?;

        let root = base.join(request_id);
        fs::DirBuilder::new()
            .mode(0o700)
            .create(&root)
            .map_err(|e| Error::setup("mkdir workspace", e))?;

        // From here on, Drop is responsible for removing the directory.
        let workspace = Self { root, isolation };
        if isolation == Isolation::Namespace {
            workspace.mount_rootfs()?;
        }
        debug!(root = ?workspace.root, "Workspace ready");
        Ok(workspace)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Host-side directory that holds the source file.
    pub fn host_dir(&self) -> PathBuf {
        match self.isolation {
            Isolation::Process => self.root.clone(),
            Isolation::Namespace => self.root.join(&CHROOT_HOME[1..]),
        }
    }

    /// Working directory as the program sees it.
    pub fn program_dir(&self) -> PathBuf {
        match self.isolation {
            Isolation::Process => self.root.clone(),
            Isolation::Namespace => PathBuf::from(CHROOT_HOME),
        }
    }

    /// Write `content` to `name` inside the program's working directory.
    pub fn write_source(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.host_dir().join(name);
        fs::write(&path, content).map_err(|e| Error::setup("write source", e))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))
            .map_err(|e| Error::setup("chmod source", e))?;
        Ok(path)
    }

    fn mount_rootfs(&self) -> Result<()> {
        let root = &self.root;
        mount(
            Some("tmpfs"),
            root,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("size=64M,mode=755"),
        )
        .map_err(|e| Error::setup("mount tmpfs", e))?;

        for dir in BIND_DIRS {
            if !Path::new(dir).exists() {
                continue;
            }
            let target = root.join(&dir[1..]);
            fs::create_dir_all(&target).map_err(|e| Error::setup(&format!("mkdir {}", dir), e))?;
            mount(
                Some(dir),
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| Error::setup(&format!("bind mount {}", dir), e))?;
            mount(
                None::<&str>,
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| Error::setup(&format!("remount ro {}", dir), e))?;
        }

        let tmp_dir = root.join("tmp");
        fs::create_dir_all(&tmp_dir).map_err(|e| Error::setup("mkdir tmp", e))?;
        fs::set_permissions(&tmp_dir, fs::Permissions::from_mode(0o1777))
            .map_err(|e| Error::setup("chmod tmp", e))?;

        let dev_dir = root.join("dev");
        fs::create_dir_all(&dev_dir).map_err(|e| Error::setup("mkdir dev", e))?;
        for dev in DEVICES {
            let host_dev = format!("/dev/{}", dev);
            if !Path::new(&host_dev).exists() {
                continue;
            }
            let sandbox_dev = dev_dir.join(dev);
            fs::write(&sandbox_dev, "").map_err(|e| Error::setup(&format!("touch {}", dev), e))?;
            mount(
                Some(host_dev.as_str()),
                &sandbox_dev,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| Error::setup(&format!("bind mount {}", dev), e))?;
        }

        let home_dir = self.host_dir();
        fs::create_dir_all(&home_dir).map_err(|e| Error::setup("mkdir home", e))?;
        fs::set_permissions(&home_dir, fs::Permissions::from_mode(0o755))
            .map_err(|e| Error::setup("chmod home", e))?;
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.isolation == Isolation::Namespace {
            unmount_rootfs(&self.root);
        }
        if let Err(e) = fs::remove_dir_all(&self.root) {
            warn!(root = ?self.root, error = %e, "Failed to remove workspace");
        } else {
            debug!(root = ?self.root, "Workspace removed");
        }
    }
}

fn unmount_rootfs(root: &Path) {
    let dev_dir = root.join("dev");
    for dev in DEVICES {
        let path = dev_dir.join(dev);
        if path.exists() {
            let _ = umount2(&path, MntFlags::MNT_DETACH);
        }
    }
    for dir in BIND_DIRS {
        let path = root.join(&dir[1..]);
        if path.exists() {
            let _ = umount2(&path, MntFlags::MNT_DETACH);
        }
    }
    let _ = umount2(root, MntFlags::MNT_DETACH);
}

/// Remove workspaces left behind by a previous run of the server.
/// Returns how many were removed.
pub fn sweep_stale(base: &Path) -> Result<usize> {
    let entries = match fs::read_dir(base) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::setup("read workspace root", e)),
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        unmount_rootfs(&path);
        match fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = ?path, error = %e, "Failed to remove stale workspace"),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_is_removed_on_drop() {
        let base = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(base.path(), "req-1", Isolation::Process).unwrap();
        let source = workspace.write_source("main.py", b"print(1)").unwrap();
        assert_eq!(fs::read(&source).unwrap(), b"print(1)");
        let root = workspace.path().to_path_buf();
        assert!(root.is_dir());

        drop(workspace);
        assert!(!root.exists());
    }

    #[test]
    fn workspace_names_are_never_reused() {
        let base = tempfile::tempdir().unwrap();
        let _first = Workspace::create(base.path(), "same", Isolation::Process).unwrap();
        let second = Workspace::create(base.path(), "same", Isolation::Process);
        assert!(matches!(second, Err(Error::Setup(_))));
    }

    #[test]
    fn rejects_names_that_escape_the_root() {
        let base = tempfile::tempdir().unwrap();
        assert!(Workspace::create(base.path(), "../x", Isolation::Process).is_err());
        assert!(Workspace::create(base.path(), "", Isolation::Process).is_err());
    }

    #[test]
    fn process_workspace_is_private() {
        let base = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(base.path(), "private", Isolation::Process).unwrap();
        let mode = fs::metadata(workspace.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert_eq!(workspace.program_dir(), workspace.host_dir());
    }

    #[test]
    fn sweep_removes_leftovers() {
        let base = tempfile::tempdir().unwrap();
        fs::create_dir_all(base.path().join("stale-a/nested")).unwrap();
        fs::create_dir_all(base.path().join("stale-b")).unwrap();
        fs::write(base.path().join("not-a-dir"), b"x").unwrap();

        assert_eq!(sweep_stale(base.path()).unwrap(), 2);
        assert!(base.path().join("not-a-dir").exists());
        assert_eq!(sweep_stale(&base.path().join("missing")).unwrap(), 0);
    }
}
