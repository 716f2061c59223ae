//! Two-phase hook registry.
//!
//! Hooks are callbacks that run inside the new namespaces during jail
//! construction, in insertion order within their phase. A hook that fails
//! returns the originating `Errno`; the launch pipeline aborts and the
//! pre-exec child exits without ever reaching the target image.

use rustix::io::Errno;

/// When a registered hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    /// Inside the new namespaces, with full (namespaced) capabilities,
    /// before the capability drop.
    PreDropCaps,
    /// Just before `execve` of the target image.
    PreExecve,
}

/// A registered callback. Owns whatever state it needs; the closure moves
/// into the jail and lives until the pre-exec child either execs or dies.
pub type Hook = Box<dyn FnMut() -> Result<(), Errno> + Send>;

pub(crate) struct HookEntry {
    pub phase: HookPhase,
    pub hook: Hook,
}

/// Run every hook registered for `phase`, in insertion order.
pub(crate) fn run_phase(entries: &mut [HookEntry], phase: HookPhase) -> Result<(), Errno> {
    for entry in entries.iter_mut().filter(|e| e.phase == phase) {
        (entry.hook)()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn recording_hook(log: &Arc<Mutex<Vec<u32>>>, id: u32) -> Hook {
        let log = Arc::clone(log);
        Box::new(move || {
            log.lock().unwrap().push(id);
            Ok(())
        })
    }

    #[test]
    fn phase_runs_in_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut entries = vec![
            HookEntry {
                phase: HookPhase::PreDropCaps,
                hook: recording_hook(&log, 1),
            },
            HookEntry {
                phase: HookPhase::PreExecve,
                hook: recording_hook(&log, 99),
            },
            HookEntry {
                phase: HookPhase::PreDropCaps,
                hook: recording_hook(&log, 2),
            },
        ];

        run_phase(&mut entries, HookPhase::PreDropCaps).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);

        run_phase(&mut entries, HookPhase::PreExecve).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 99]);
    }

    #[test]
    fn failing_hook_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut entries = vec![
            HookEntry {
                phase: HookPhase::PreDropCaps,
                hook: Box::new(|| Err(Errno::NXIO)),
            },
            HookEntry {
                phase: HookPhase::PreDropCaps,
                hook: recording_hook(&log, 1),
            },
        ];

        assert_eq!(
            run_phase(&mut entries, HookPhase::PreDropCaps),
            Err(Errno::NXIO)
        );
        assert!(log.lock().unwrap().is_empty());
    }
}
