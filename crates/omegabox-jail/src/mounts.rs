//! Jail mount table.
//!
//! Mount entries apply in insertion order inside the new mount namespace,
//! after the propagation of the host tree has been cut off with a recursive
//! `MS_PRIVATE` remount. Bind mounts of regular files get their mountpoint
//! created as an empty file; everything else gets a directory.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use rustix::io::Errno;

use omegabox_sys::last_errno;

/// One entry in the jail's mount table.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
}

impl MountSpec {
    /// Bind `source` onto `target`, optionally read-only.
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<PathBuf>, writable: bool) -> Self {
        let mut flags = MsFlags::MS_BIND;
        if !writable {
            flags |= MsFlags::MS_RDONLY;
        }
        Self {
            source: source.into(),
            target: target.into(),
            fstype: None,
            flags,
            data: None,
        }
    }

    /// A fresh tmpfs at `target` with the given mount data.
    pub fn tmpfs(target: impl Into<PathBuf>, data: impl Into<String>) -> Self {
        Self {
            source: PathBuf::from("none"),
            target: target.into(),
            fstype: Some("tmpfs".into()),
            flags: MsFlags::MS_NOEXEC | MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
            data: Some(data.into()),
        }
    }

    /// A fresh procfs at `target`.
    pub fn proc(target: impl Into<PathBuf>) -> Self {
        Self {
            source: PathBuf::from("proc"),
            target: target.into(),
            fstype: Some("proc".into()),
            flags: MsFlags::MS_RDONLY | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
            data: None,
        }
    }

    fn is_bind(&self) -> bool {
        self.flags.contains(MsFlags::MS_BIND)
    }
}

/// Cut mount propagation from the host: remount `/` recursively private.
pub fn make_rprivate() -> Result<(), Errno> {
    // SAFETY: constant arguments, no pointers into freed memory.
    let ret = unsafe {
        libc::mount(
            std::ptr::null(),
            c"/".as_ptr(),
            std::ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            std::ptr::null(),
        )
    };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Apply one mount entry, creating the mountpoint if needed.
pub fn apply(spec: &MountSpec) -> Result<(), Errno> {
    ensure_mountpoint(spec)?;

    let source = path_cstring(&spec.source)?;
    let target = path_cstring(&spec.target)?;
    let fstype = match &spec.fstype {
        Some(t) => Some(CString::new(t.as_str()).map_err(|_| Errno::INVAL)?),
        None => None,
    };
    let data = match &spec.data {
        Some(d) => Some(CString::new(d.as_str()).map_err(|_| Errno::INVAL)?),
        None => None,
    };

    // SAFETY: all pointers reference CStrings alive across the call.
    let ret = unsafe {
        libc::mount(
            source.as_ptr(),
            target.as_ptr(),
            fstype.as_ref().map_or(std::ptr::null(), |t| t.as_ptr()),
            spec.flags.bits() as libc::c_ulong,
            data.as_ref()
                .map_or(std::ptr::null(), |d| d.as_ptr().cast()),
        )
    };
    if ret != 0 {
        return Err(last_errno());
    }

    // A read-only bind needs a second remount pass; the initial bind
    // silently ignores MS_RDONLY.
    if spec.is_bind() && spec.flags.contains(MsFlags::MS_RDONLY) {
        // SAFETY: as above.
        let ret = unsafe {
            libc::mount(
                std::ptr::null(),
                target.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY,
                std::ptr::null(),
            )
        };
        if ret != 0 {
            return Err(last_errno());
        }
    }
    Ok(())
}

fn ensure_mountpoint(spec: &MountSpec) -> Result<(), Errno> {
    if spec.target.exists() {
        return Ok(());
    }
    if spec.is_bind() && spec.source.is_file() {
        if let Some(parent) = spec.target.parent() {
            std::fs::create_dir_all(parent).map_err(io_errno)?;
        }
        std::fs::File::create(&spec.target).map_err(io_errno)?;
    } else {
        std::fs::create_dir_all(&spec.target).map_err(io_errno)?;
    }
    Ok(())
}

fn io_errno(err: std::io::Error) -> Errno {
    Errno::from_raw_os_error(err.raw_os_error().unwrap_or(libc::EIO))
}

fn path_cstring(path: &Path) -> Result<CString, Errno> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::INVAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_flags() {
        let ro = MountSpec::bind("/etc", "/jail/etc", false);
        assert!(ro.flags.contains(MsFlags::MS_BIND));
        assert!(ro.flags.contains(MsFlags::MS_RDONLY));

        let rw = MountSpec::bind("/tmp", "/jail/tmp", true);
        assert!(!rw.flags.contains(MsFlags::MS_RDONLY));
    }

    #[test]
    fn tmpfs_spec() {
        let spec = MountSpec::tmpfs("/mnt/stdio", "size=4096,mode=555");
        assert_eq!(spec.fstype.as_deref(), Some("tmpfs"));
        assert!(spec.flags.contains(MsFlags::MS_NOEXEC));
        assert_eq!(spec.data.as_deref(), Some("size=4096,mode=555"));
    }

    #[test]
    fn proc_spec_is_read_only() {
        let spec = MountSpec::proc("/proc");
        assert!(spec.flags.contains(MsFlags::MS_RDONLY));
        assert!(spec.flags.contains(MsFlags::MS_NOSUID));
    }

    #[test]
    fn mountpoint_for_file_bind() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        std::fs::write(&source, b"x").unwrap();
        let target = dir.path().join("mnt/stdio/stdin");

        let spec = MountSpec::bind(&source, &target, false);
        ensure_mountpoint(&spec).unwrap();
        assert!(target.is_file());
    }
}
