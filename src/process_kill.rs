//! Process-signal fallback: interrupt the sidecar by process name.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::OsStr;
use sysinfo::{ProcessesToUpdate, System};

#[derive(Debug, thiserror::Error)]
pub enum KillError {
    #[error("no process named {name:?} is running")]
    NotFound { name: String },
    #[error("failed to signal {name:?}: {source}")]
    Signal { name: String, source: nix::Error },
}

/// Last-resort way to stop the sidecar when its quit API is unavailable.
pub trait SidecarKiller: Send + Sync {
    /// Deliver an interrupt to the sidecar. Returns how many processes were
    /// signalled.
    fn interrupt(&self) -> Result<usize, KillError>;
}

/// Sends SIGINT to every process whose name matches exactly.
pub struct ProcessNameKiller {
    name: String,
}

impl ProcessNameKiller {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn matching_pids(&self) -> Vec<Pid> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let own_pid = std::process::id();
        system
            .processes_by_exact_name(OsStr::new(&self.name))
            .map(|process| process.pid().as_u32())
            .filter(|&pid| pid != own_pid)
            .map(|pid| Pid::from_raw(pid as i32))
            .collect()
    }
}

impl SidecarKiller for ProcessNameKiller {
    fn interrupt(&self) -> Result<usize, KillError> {
        let pids = self.matching_pids();
        if pids.is_empty() {
            return Err(KillError::NotFound {
                name: self.name.clone(),
            });
        }

        let mut signalled = 0;
        let mut last_error = None;
        for pid in pids {
            match kill(pid, Signal::SIGINT) {
                Ok(()) => {
                    tracing::info!(name = %self.name, %pid, "sent SIGINT to sidecar");
                    signalled += 1;
                }
                Err(e) => {
                    tracing::warn!(name = %self.name, %pid, error = %e, "failed to send SIGINT");
                    last_error = Some(e);
                }
            }
        }

        match (signalled, last_error) {
            (0, Some(source)) => Err(KillError::Signal {
                name: self.name.clone(),
                source,
            }),
            (n, _) => Ok(n),
        }
    }
}
