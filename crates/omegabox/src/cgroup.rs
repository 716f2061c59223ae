//! Control-group resource limits and accounting.
//!
//! The sandbox supports both hierarchies. On v2 one unified cgroup per
//! invocation lives under `/sys/fs/cgroup/omegabox/<script>/`; on v1 the
//! invocation gets a `memory/omegabox/...` group (when a memory limit is
//! set) and a `pids/omegabox/<script>/...` group.
//!
//! Ownership is two-stage: the creating process owns the directory until the
//! target has been admitted and the admission file sealed read-only, then
//! [`ScopedCgroup::release`] disarms the destructor and the admitted task
//! keeps the group alive until the kernel reaps it empty.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Root of the per-script subtree on a unified hierarchy.
pub const UNIFIED_ROOT: &str = "/sys/fs/cgroup/omegabox";
/// Parent of v1 memory groups.
pub const V1_MEMORY_PARENT: &str = "/sys/fs/cgroup/memory/omegabox";
/// Parent of v1 pid groups.
pub const V1_PIDS_ROOT: &str = "/sys/fs/cgroup/pids/omegabox";

#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no free cgroup slot under {0}")]
    Exhausted(PathBuf),
}

impl CgroupError {
    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// The errno of the originating failure, for hook propagation.
    pub fn errno(&self) -> rustix::io::Errno {
        let raw = match self {
            Self::Io { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            Self::Exhausted(_) => libc::EEXIST,
        };
        rustix::io::Errno::from_raw_os_error(raw)
    }
}

/// Does this host use the unified (v2) hierarchy?
pub fn is_cgroup_v2() -> bool {
    Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
}

/// Scoped owner of a created cgroup directory.
#[derive(Debug)]
pub struct ScopedCgroup {
    path: PathBuf,
    unified: bool,
    armed: bool,
}

impl ScopedCgroup {
    /// Create `<parent>/omegabox_<n>` for the first free `n`.
    pub fn create(parent: &Path, unified: bool) -> Result<Self, CgroupError> {
        for attempt in 0..=1000 {
            let path = parent.join(format!("omegabox_{attempt}"));
            match fs::create_dir(&path) {
                Ok(()) => {
                    return Ok(Self {
                        path,
                        unified,
                        armed: true,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(CgroupError::io("mkdir", &path, err)),
            }
        }
        Err(CgroupError::Exhausted(parent.to_path_buf()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn admission_file(&self) -> PathBuf {
        self.path
            .join(if self.unified { "cgroup.procs" } else { "tasks" })
    }

    fn memory_limit_file(&self) -> PathBuf {
        self.path.join(if self.unified {
            "memory.max"
        } else {
            "memory.limit_in_bytes"
        })
    }

    /// Write the memory ceiling and seal the limit file read-only.
    pub fn set_memory_max(&self, bytes: i64) -> Result<(), CgroupError> {
        let path = self.memory_limit_file();
        write_file(&path, &format!("{bytes}"), false)
            .map_err(|e| CgroupError::io("write", &path, e))?;
        seal_read_only(&path)
    }

    /// Admit `pid` into the group.
    pub fn admit(&self, pid: libc::pid_t) -> Result<(), CgroupError> {
        let path = self.admission_file();
        let line = if self.unified {
            format!("+{pid}\n")
        } else {
            format!("{pid}\n")
        };
        write_file(&path, &line, true).map_err(|e| CgroupError::io("write", &path, e))
    }

    /// Seal the admission file read-only so the target cannot relax its own
    /// limits even with leftover ambient capabilities.
    pub fn seal(&self) -> Result<(), CgroupError> {
        seal_read_only(&self.admission_file())
    }

    /// Transfer ownership away: the admitted task now pins the group and the
    /// kernel reaps the directory once it empties.
    pub fn release(&mut self) {
        self.armed = false;
    }

    /// v1 memory-controller failure count. Non-zero means the kernel held
    /// the group at its ceiling and `ru_maxrss` underreports.
    pub fn read_failcnt(&self) -> Result<u64, CgroupError> {
        let path = self.path.join("memory.failcnt");
        let text =
            fs::read_to_string(&path).map_err(|e| CgroupError::io("read", &path, e))?;
        text.trim().parse::<u64>().map_err(|e| {
            CgroupError::io(
                "parse",
                &path,
                io::Error::new(io::ErrorKind::InvalidData, e),
            )
        })
    }
}

impl Drop for ScopedCgroup {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_dir(&self.path);
        }
    }
}

/// Pre-stage for the supervisor: locate (and on v2, create) the per-script
/// parent directory that invocation groups nest under. Returns `None` when
/// the subtree is absent or not writable; the run then proceeds without
/// cgroup accounting.
pub fn prepare_script_parent(script: &str) -> Result<Option<PathBuf>, CgroupError> {
    if is_cgroup_v2() {
        let root = Path::new(UNIFIED_ROOT);
        if !is_writable(root) {
            return Ok(None);
        }
        let parent = root.join(script);
        match fs::create_dir(&parent) {
            Ok(()) => {
                let control = parent.join("cgroup.subtree_control");
                write_file(&control, "+memory", false)
                    .map_err(|e| CgroupError::io("write", &control, e))?;
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(CgroupError::io("mkdir", &parent, err)),
        }
        Ok(Some(parent))
    } else {
        let parent = Path::new(V1_PIDS_ROOT).join(script);
        if is_writable(&parent) {
            Ok(Some(parent))
        } else {
            Ok(None)
        }
    }
}

fn is_writable(path: &Path) -> bool {
    nix::unistd::access(path, nix::unistd::AccessFlags::W_OK).is_ok()
}

fn write_file(path: &Path, contents: &str, append: bool) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true);
    if append {
        options.append(true);
    } else {
        options.truncate(true);
    }
    let mut file = options.open(path)?;
    file.write_all(contents.as_bytes())
}

fn seal_read_only(path: &Path) -> Result<(), CgroupError> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o444))
        .map_err(|e| CgroupError::io("chmod", path, e))
}
