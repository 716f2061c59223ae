//! Kernel resource limits.
//!
//! Limits arrive on the command line as `NAME=value` pairs and are applied
//! in the pre-exec child, after the fork and before the target image loads.

use nix::sys::resource::{setrlimit, Resource};
use rustix::io::Errno;

use omegabox_sys::ErrnoSaver;

/// One soft limit to install (soft and hard are set together).
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimit {
    pub resource: Resource,
    pub soft: u64,
    pub hard: u64,
}

impl ResourceLimit {
    pub fn new(resource: Resource, value: u64) -> Self {
        Self {
            resource,
            soft: value,
            hard: value,
        }
    }
}

/// Resolve an rlimit name (`CPU`, `FSIZE`, ...; an `RLIMIT_` prefix is
/// accepted) to its kernel identifier.
pub fn resource_by_name(name: &str) -> Option<Resource> {
    let name = name.strip_prefix("RLIMIT_").unwrap_or(name);
    let resource = match name {
        "CPU" => Resource::RLIMIT_CPU,
        "FSIZE" => Resource::RLIMIT_FSIZE,
        "DATA" => Resource::RLIMIT_DATA,
        "STACK" => Resource::RLIMIT_STACK,
        "CORE" => Resource::RLIMIT_CORE,
        "RSS" => Resource::RLIMIT_RSS,
        "NPROC" => Resource::RLIMIT_NPROC,
        "NOFILE" => Resource::RLIMIT_NOFILE,
        "MEMLOCK" => Resource::RLIMIT_MEMLOCK,
        "AS" => Resource::RLIMIT_AS,
        "LOCKS" => Resource::RLIMIT_LOCKS,
        "SIGPENDING" => Resource::RLIMIT_SIGPENDING,
        "MSGQUEUE" => Resource::RLIMIT_MSGQUEUE,
        "NICE" => Resource::RLIMIT_NICE,
        "RTPRIO" => Resource::RLIMIT_RTPRIO,
        "RTTIME" => Resource::RLIMIT_RTTIME,
        _ => return None,
    };
    Some(resource)
}

/// Parse a `NAME=value` limit specification.
pub fn parse(spec: &str) -> Result<ResourceLimit, String> {
    let (name, value) = spec
        .split_once('=')
        .ok_or_else(|| format!("invalid rlimit '{spec}': expected NAME=value"))?;
    let resource =
        resource_by_name(name).ok_or_else(|| format!("unknown rlimit name '{name}'"))?;
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid rlimit value '{value}'"))?;
    Ok(ResourceLimit::new(resource, value))
}

/// Apply every limit to the calling process.
pub fn apply(limits: &[ResourceLimit]) -> Result<(), Errno> {
    for limit in limits {
        if let Err(err) = setrlimit(limit.resource, limit.soft, limit.hard) {
            {
                let _errno = ErrnoSaver::new();
                tracing::error!(resource = ?limit.resource, "failed to set resource limit");
            }
            return Err(Errno::from_raw_os_error(err as i32));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use nix::sys::resource::getrlimit;

    use super::*;

    #[test]
    fn parse_name_value() {
        let limit = parse("FSIZE=65536").unwrap();
        assert_eq!(limit.resource, Resource::RLIMIT_FSIZE);
        assert_eq!(limit.soft, 65536);
        assert_eq!(limit.hard, 65536);
    }

    #[test]
    fn parse_accepts_prefixed_name() {
        let limit = parse("RLIMIT_STACK=8388608").unwrap();
        assert_eq!(limit.resource, Resource::RLIMIT_STACK);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse("FSIZE").is_err());
        assert!(parse("NOT_A_LIMIT=1").is_err());
        assert!(parse("CPU=many").is_err());
    }

    #[test]
    fn apply_accepts_current_nofile() {
        let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        apply(&[ResourceLimit {
            resource: Resource::RLIMIT_NOFILE,
            soft,
            hard,
        }])
        .unwrap();
    }
}
