//! Signal relay between the orchestrator and its child.
//!
//! Before the child exists only SIGINT and SIGTERM are caught, and either one
//! aborts the run. Once the supervisor publishes the child pid the relay
//! widens to every catchable signal, realtime ones included, and forwards
//! each verbatim. Runtime artifacts are dropped, and so is anything that
//! arrives after the child was reaped.
use crate::supervisor::{ChildSlot, SlotState};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::io;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::SignalStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;

/// Caught while no child exists.
pub const PRE_LAUNCH_SIGNALS: &[Signal] = &[Signal::SIGINT, Signal::SIGTERM];

/// Never registered. SIGKILL and SIGSTOP cannot be caught, the fault
/// signals are refused by the runtime, and SIGCHLD belongs to the process
/// reaper.
const NEVER_CAUGHT: &[Signal] = &[
    Signal::SIGKILL,
    Signal::SIGSTOP,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGCHLD,
];

/// Signals produced by the runtime itself rather than by whoever manages us.
const RUNTIME_ARTIFACTS: &[Signal] = &[Signal::SIGURG, Signal::SIGCHLD];

pub fn is_runtime_artifact(signo: i32) -> bool {
    RUNTIME_ARTIFACTS.iter().any(|&sig| sig as i32 == signo)
}

#[cfg(target_os = "linux")]
fn realtime_signals() -> RangeInclusive<i32> {
    libc::SIGRTMIN()..=libc::SIGRTMAX()
}

#[cfg(not(target_os = "linux"))]
#[allow(clippy::reversed_empty_ranges)]
fn realtime_signals() -> RangeInclusive<i32> {
    1..=0
}

/// Every signal the relay listens for once the child is running.
pub fn relayed_signals() -> Vec<i32> {
    Signal::iterator()
        .filter(|sig| !NEVER_CAUGHT.contains(sig))
        .map(|sig| sig as i32)
        .chain(realtime_signals())
        .collect()
}

/// Human-readable name for log records.
pub fn signal_name(signo: i32) -> String {
    match Signal::try_from(signo) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => match realtime_signals() {
            rt if rt.contains(&signo) => format!("SIGRTMIN+{}", signo - rt.start()),
            _ => format!("signal {signo}"),
        },
    }
}

/// What to do with one received signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    Ignore,
    Forward(Pid),
    /// The child was already reaped; its pid may belong to someone else now.
    ChildGone,
    Abort,
}

/// Decide how to handle `signo` given the current child slot.
///
/// With no child yet, the slot is claimed for abort. If the supervisor
/// published a pid in the meantime the signal is forwarded instead.
pub fn classify(signo: i32, slot: &ChildSlot) -> RelayAction {
    if is_runtime_artifact(signo) {
        return RelayAction::Ignore;
    }
    if slot.abort() {
        return RelayAction::Abort;
    }
    // The abort lost, so the slot has left pending for good.
    match slot.state() {
        SlotState::Running(pid) => RelayAction::Forward(pid),
        SlotState::Exited => RelayAction::ChildGone,
        SlotState::Pending | SlotState::Aborted => RelayAction::Abort,
    }
}

/// Deliver `signo` to `pid`, realtime signals included.
pub fn send_signal(pid: Pid, signo: i32) -> io::Result<()> {
    // SAFETY: kill(2) touches no memory; a stale pid or bad signal number
    // only produces an error code.
    let result = unsafe { libc::kill(pid.as_raw(), signo) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub struct SignalRelay {
    slot: Arc<ChildSlot>,
    abort: CancellationToken,
    streams: StreamMap<i32, SignalStream>,
    launched: oneshot::Receiver<()>,
}

impl SignalRelay {
    /// Register the pre-launch handlers. `abort` is cancelled when a signal
    /// arrives before the child exists; `launched` widens the caught set.
    pub fn install(
        slot: Arc<ChildSlot>,
        abort: CancellationToken,
        launched: oneshot::Receiver<()>,
    ) -> io::Result<Self> {
        let mut streams = StreamMap::new();
        for &sig in PRE_LAUNCH_SIGNALS {
            register(&mut streams, sig as i32)?;
        }
        Ok(Self {
            slot,
            abort,
            streams,
            launched,
        })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let SignalRelay {
            slot,
            abort,
            mut streams,
            mut launched,
        } = self;
        let mut widened = false;

        loop {
            tokio::select! {
                result = &mut launched, if !widened => {
                    widened = true;
                    if result.is_ok() {
                        widen(&mut streams);
                    }
                }
                next = streams.next() => {
                    let Some((signo, ())) = next else {
                        return;
                    };
                    handle(signo, &slot, &abort);
                }
            }
        }
    }
}

fn register(streams: &mut StreamMap<i32, SignalStream>, signo: i32) -> io::Result<()> {
    if !streams.contains_key(&signo) {
        let stream = signal(SignalKind::from_raw(signo))?;
        streams.insert(signo, SignalStream::new(stream));
    }
    Ok(())
}

/// Listen for the full relayed set. A signal that cannot be registered is
/// logged and skipped; the rest still get relayed.
fn widen(streams: &mut StreamMap<i32, SignalStream>) {
    for signo in relayed_signals() {
        if let Err(e) = register(streams, signo) {
            tracing::warn!(signal = %signal_name(signo), error = %e, "failed to register signal handler");
        }
    }
    tracing::debug!(count = streams.len(), "relaying all signals to child");
}

fn handle(signo: i32, slot: &ChildSlot, abort: &CancellationToken) {
    let name = signal_name(signo);
    match classify(signo, slot) {
        RelayAction::Ignore => {
            tracing::debug!(signal = %name, "ignoring runtime signal");
        }
        RelayAction::Forward(pid) => {
            tracing::info!(signal = %name, %pid, "passing signal to child");
            if let Err(e) = send_signal(pid, signo) {
                tracing::warn!(signal = %name, %pid, error = %e, "failed to signal child");
            }
        }
        RelayAction::ChildGone => {
            tracing::info!(signal = %name, "child already exited, dropping signal");
        }
        RelayAction::Abort => {
            tracing::info!(signal = %name, "signal received before child started, aborting");
            abort.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::Supervisor;
    use crate::test_support::PROCESS_SIGNALS;
    use std::os::unix::process::ExitStatusExt;
    use std::time::Duration;
    use tokio::process::Command;

    const SIGTERM: i32 = Signal::SIGTERM as i32;

    #[test]
    fn test_runtime_artifacts_are_filtered() {
        assert!(is_runtime_artifact(Signal::SIGURG as i32));
        assert!(is_runtime_artifact(Signal::SIGCHLD as i32));
        assert!(!is_runtime_artifact(SIGTERM));
        assert!(!is_runtime_artifact(Signal::SIGINT as i32));
    }

    #[test]
    fn test_pre_launch_set_is_narrower() {
        let relayed = relayed_signals();
        assert!(PRE_LAUNCH_SIGNALS.len() < relayed.len());
        for &sig in PRE_LAUNCH_SIGNALS {
            assert!(relayed.contains(&(sig as i32)));
        }
    }

    #[test]
    fn test_uncatchable_signals_are_not_registered() {
        let relayed = relayed_signals();
        for sig in [
            Signal::SIGKILL,
            Signal::SIGSTOP,
            Signal::SIGCHLD,
            Signal::SIGSEGV,
        ] {
            assert!(!relayed.contains(&(sig as i32)), "{sig} should not be caught");
        }
    }

    #[test]
    fn test_relayed_set_covers_uncommon_signals() {
        let relayed = relayed_signals();
        for sig in [
            Signal::SIGHUP,
            Signal::SIGUSR1,
            Signal::SIGWINCH,
            Signal::SIGPROF,
            Signal::SIGXCPU,
            Signal::SIGSYS,
            Signal::SIGURG,
        ] {
            assert!(relayed.contains(&(sig as i32)), "{sig} should be caught");
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_relayed_set_covers_power_and_realtime_signals() {
        let relayed = relayed_signals();
        assert!(relayed.contains(&(Signal::SIGPWR as i32)));
        assert!(relayed.contains(&libc::SIGRTMIN()));
        assert!(relayed.contains(&libc::SIGRTMAX()));
        assert_eq!(signal_name(libc::SIGRTMIN() + 2), "SIGRTMIN+2");
        assert_eq!(signal_name(SIGTERM), "SIGTERM");
    }

    #[test]
    fn test_classify_artifact_is_ignored_before_and_after_launch() {
        let slot = ChildSlot::new();
        assert_eq!(classify(Signal::SIGURG as i32, &slot), RelayAction::Ignore);
        assert!(!slot.is_aborted());

        slot.publish(Pid::from_raw(77));
        assert_eq!(classify(Signal::SIGURG as i32, &slot), RelayAction::Ignore);
    }

    #[test]
    fn test_classify_before_launch_aborts() {
        let slot = ChildSlot::new();
        assert_eq!(classify(SIGTERM, &slot), RelayAction::Abort);
        assert!(slot.is_aborted());
        assert_eq!(classify(Signal::SIGINT as i32, &slot), RelayAction::Abort);
    }

    #[test]
    fn test_classify_after_launch_forwards() {
        let slot = ChildSlot::new();
        slot.publish(Pid::from_raw(77));
        assert_eq!(
            classify(SIGTERM, &slot),
            RelayAction::Forward(Pid::from_raw(77))
        );
        assert_eq!(
            classify(Signal::SIGHUP as i32, &slot),
            RelayAction::Forward(Pid::from_raw(77))
        );
    }

    #[tokio::test]
    async fn test_classify_after_child_reaped_drops_signal() {
        let slot = Arc::new(ChildSlot::new());
        let (tx, _rx) = oneshot::channel();
        Supervisor::new(Arc::clone(&slot), tx)
            .run("true", &[])
            .await
            .unwrap();

        assert_eq!(classify(SIGTERM, &slot), RelayAction::ChildGone);
        assert!(!slot.is_aborted());
    }

    #[tokio::test]
    async fn test_send_signal_delivers_realtime_signal() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id().unwrap() as i32);
        let signo = realtime_signals().next().unwrap_or(Signal::SIGUSR2 as i32);

        send_signal(pid, signo).unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("child did not receive the signal")
            .unwrap();
        assert_eq!(status.signal(), Some(signo));
    }

    #[tokio::test]
    async fn test_relay_aborts_on_signal_before_launch() {
        let _guard = PROCESS_SIGNALS.lock().await;
        let slot = Arc::new(ChildSlot::new());
        let abort = CancellationToken::new();
        let (_launched_tx, launched_rx) = oneshot::channel();
        let relay = SignalRelay::install(Arc::clone(&slot), abort.clone(), launched_rx)
            .unwrap()
            .spawn();

        send_signal(Pid::this(), SIGTERM).unwrap();

        tokio::time::timeout(Duration::from_secs(2), abort.cancelled())
            .await
            .expect("abort was not requested");
        assert!(slot.is_aborted());
        relay.abort();
    }

    /// Launch `sleep`, start a relay for it and raise `signo` at this
    /// process until the child dies from it.
    async fn assert_relayed(signo: i32) {
        let _guard = PROCESS_SIGNALS.lock().await;
        // Keep the signal from killing the test process before the relay widens.
        let _listener = signal(SignalKind::from_raw(signo)).unwrap();

        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id().unwrap() as i32);

        let slot = Arc::new(ChildSlot::new());
        let abort = CancellationToken::new();
        let (launched_tx, launched_rx) = oneshot::channel();
        let relay = SignalRelay::install(Arc::clone(&slot), abort.clone(), launched_rx)
            .unwrap()
            .spawn();

        assert!(slot.publish(pid));
        launched_tx.send(()).unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                send_signal(Pid::this(), signo).unwrap();
                tokio::select! {
                    status = child.wait() => return status.unwrap(),
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
        })
        .await
        .expect("child did not receive the signal");

        assert_eq!(status.signal(), Some(signo));
        assert!(!abort.is_cancelled());
        relay.abort();
    }

    #[tokio::test]
    async fn test_relay_forwards_to_child_after_launch() {
        assert_relayed(Signal::SIGUSR1 as i32).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_relay_forwards_power_failure_signal() {
        assert_relayed(Signal::SIGPWR as i32).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_relay_forwards_realtime_signal() {
        assert_relayed(libc::SIGRTMIN() + 1).await;
    }
}
