//! Child process lifecycle: resolve the target binary, launch it with
//! inherited stdio, publish its pid to the signal relay, and wait for exit.

use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::oneshot;

const PENDING: i32 = 0;
const ABORTED: i32 = -1;
const EXITED: i32 = -2;

/// Exit code used when scuttle stops before the child could run.
pub const ABORT_EXIT_CODE: i32 = 1;

/// Single-assignment handoff of the child pid between the supervisor and
/// the signal relay.
///
/// Starts pending and moves exactly once, either to a pid (child launched)
/// or to aborted (a signal arrived first). Both transitions are a single
/// compare-and-swap, so exactly one side wins. A launched child moves to
/// exited once it has been reaped, after which its pid may be reused.
#[derive(Debug)]
pub struct ChildSlot {
    state: AtomicI32,
}

/// Snapshot of a [`ChildSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Pending,
    Aborted,
    Running(Pid),
    Exited,
}

impl ChildSlot {
    pub fn new() -> Self {
        Self {
            state: AtomicI32::new(PENDING),
        }
    }

    /// Record the launched child. Returns false if an abort got there first.
    pub fn publish(&self, pid: Pid) -> bool {
        self.state
            .compare_exchange(PENDING, pid.as_raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the slot for the pre-launch abort path. Returns false if a child
    /// was already published.
    pub fn abort(&self) -> bool {
        match self
            .state
            .compare_exchange(PENDING, ABORTED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == ABORTED,
        }
    }

    /// Record that the child was reaped. Its pid must not be signalled again.
    pub fn mark_exited(&self) {
        self.state.store(EXITED, Ordering::Release);
    }

    pub fn state(&self) -> SlotState {
        match self.state.load(Ordering::Acquire) {
            PENDING => SlotState::Pending,
            ABORTED => SlotState::Aborted,
            EXITED => SlotState::Exited,
            raw => SlotState::Running(Pid::from_raw(raw)),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == SlotState::Aborted
    }
}

impl Default for ChildSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// How supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The child ran and exited with this code.
    Exited(i32),
    /// A signal arrived before the child was running.
    AbortedBeforeLaunch,
}

/// Fatal supervision failures. None of these run the shutdown cascade.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("executable {command:?} not found: {source}")]
    NotFound {
        command: String,
        source: which::Error,
    },
    #[error("failed to launch {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        source: std::io::Error,
    },
    #[error("launched child has no pid")]
    MissingPid,
    #[error("failed to wait for child: {source}")]
    Wait { source: std::io::Error },
}

/// Look `command` up on `PATH` (or use it directly if it contains a slash).
pub fn resolve_executable(command: &str) -> Result<PathBuf, SupervisorError> {
    which::which(command).map_err(|source| SupervisorError::NotFound {
        command: command.to_string(),
        source,
    })
}

/// Numeric exit code; a signal death maps to `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => ABORT_EXIT_CODE,
    }
}

pub struct Supervisor {
    slot: Arc<ChildSlot>,
    launched: Option<oneshot::Sender<()>>,
}

impl Supervisor {
    /// `launched` fires once the child pid has been published.
    pub fn new(slot: Arc<ChildSlot>, launched: oneshot::Sender<()>) -> Self {
        Self {
            slot,
            launched: Some(launched),
        }
    }

    /// Launch `command` with `args` and block until it exits.
    pub async fn run(
        &mut self,
        command: &str,
        args: &[String],
    ) -> Result<RunOutcome, SupervisorError> {
        if self.slot.is_aborted() {
            return Ok(RunOutcome::AbortedBeforeLaunch);
        }

        let binary = resolve_executable(command)?;
        tracing::info!(
            command,
            binary = %binary.display(),
            args = ?args,
            "launching child process"
        );

        let mut child = Command::new(&binary)
            .arg0(command)
            .args(args)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                binary: binary.clone(),
                source,
            })?;

        let raw_pid = child.id().ok_or(SupervisorError::MissingPid)?;
        let pid = Pid::from_raw(raw_pid as i32);

        if !self.slot.publish(pid) {
            tracing::warn!(%pid, "abort requested during launch, stopping child");
            if let Err(e) = child.start_kill() {
                tracing::warn!(%pid, error = %e, "failed to stop child");
            }
            let _ = child.wait().await;
            return Ok(RunOutcome::AbortedBeforeLaunch);
        }

        tracing::info!(%pid, "child process started");
        if let Some(launched) = self.launched.take() {
            let _ = launched.send(());
        }

        let waited = child.wait().await;
        self.slot.mark_exited();
        let status = waited.map_err(|source| SupervisorError::Wait { source })?;
        let code = exit_code(status);
        tracing::info!(%pid, exit_code = code, %status, "child process exited");

        Ok(RunOutcome::Exited(code))
    }
}
