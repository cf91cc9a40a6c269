//! Readiness gate: hold the child back until the sidecar admin API reports
//! `LIVE`, a deadline fires, or the wait is cancelled.

use crate::config::Settings;
use backon::{BackoffBuilder, ExponentialBuilder};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// The only `state` value that counts as ready.
const LIVE_STATE: &str = "LIVE";

const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);
const POLL_MULTIPLIER: f32 = 1.5;

/// Upper bound on a single `server_info` request.
const POLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How the readiness wait ended. Produced once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// Sidecar reported live, or gating is disabled.
    Started,
    /// Someone cancelled the wait; treated like `Started` by the caller.
    CancelledExternally,
    /// Soft deadline passed; the child is launched anyway.
    SoftTimeoutContinue,
    /// Hard deadline passed; the child must not be launched.
    HardTimeoutAbort,
}

impl ReadinessOutcome {
    pub fn should_launch(self) -> bool {
        !matches!(self, ReadinessOutcome::HardTimeoutAbort)
    }
}

/// Wall-clock bound on the whole wait, measured from gate entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Hard(Duration),
    Soft(Duration),
    Unbounded,
}

impl Deadline {
    /// A non-zero hard timeout wins over the soft one.
    pub fn from_settings(settings: &Settings) -> Self {
        if !settings.hard_wait_timeout.is_zero() {
            Deadline::Hard(settings.hard_wait_timeout)
        } else if !settings.wait_timeout.is_zero() {
            Deadline::Soft(settings.wait_timeout)
        } else {
            Deadline::Unbounded
        }
    }

    /// How long to wait, and the outcome once that time is up.
    fn limit(self) -> Option<(Duration, ReadinessOutcome)> {
        match self {
            Deadline::Hard(d) => Some((d, ReadinessOutcome::HardTimeoutAbort)),
            Deadline::Soft(d) => Some((d, ReadinessOutcome::SoftTimeoutContinue)),
            Deadline::Unbounded => None,
        }
    }
}

/// Body of `GET {admin}/server_info`; only `state` is read.
#[derive(Debug, Deserialize)]
struct ServerInfo {
    state: String,
}

#[derive(Debug, thiserror::Error)]
enum PollError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("state is {0:?}, not ready yet")]
    NotLive(String),
}

/// Delay schedule between polls: starts at 500ms, grows by 1.5x, caps at
/// 60s and never ends. No jitter, so delays never shrink.
pub fn poll_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(INITIAL_POLL_INTERVAL)
        .with_factor(POLL_MULTIPLIER)
        .with_max_delay(MAX_POLL_INTERVAL)
        .without_max_times()
}

pub struct ReadinessGate {
    /// `None` when gating is disabled.
    server_info_url: Option<String>,
    deadline: Deadline,
    client: reqwest::Client,
    backoff: ExponentialBuilder,
    cancel: CancellationToken,
}

impl ReadinessGate {
    pub fn new(settings: &Settings, client: reqwest::Client) -> Self {
        let server_info_url = if settings.start_without_sidecar {
            None
        } else {
            settings
                .sidecar_admin_url
                .as_deref()
                .map(|admin| format!("{}/server_info", admin.trim_end_matches('/')))
        };

        Self {
            server_info_url,
            deadline: Deadline::from_settings(settings),
            client,
            backoff: poll_backoff(),
            cancel: CancellationToken::new(),
        }
    }

    /// Handle that stops the wait when cancelled. Cancelling more than once
    /// is harmless.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Block until the sidecar is live or the deadline policy decides.
    ///
    /// Poll failures of any kind only schedule the next attempt. On
    /// cancellation the in-flight request is dropped and its result never
    /// observed.
    pub async fn wait(&self) -> ReadinessOutcome {
        let Some(url) = self.server_info_url.as_deref() else {
            tracing::info!("readiness gating disabled, starting immediately");
            return ReadinessOutcome::Started;
        };

        tracing::info!(url, deadline = ?self.deadline, "blocking until sidecar is live");
        let start = Instant::now();

        let bounded = async {
            match self.deadline.limit() {
                Some((limit, on_expiry)) => {
                    match tokio::time::timeout(limit, self.poll_until_live(url)).await {
                        Ok(()) => ReadinessOutcome::Started,
                        Err(_) => on_expiry,
                    }
                }
                None => {
                    self.poll_until_live(url).await;
                    ReadinessOutcome::Started
                }
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => ReadinessOutcome::CancelledExternally,
            outcome = bounded => outcome,
        };

        tracing::info!(
            ?outcome,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "readiness wait finished"
        );
        outcome
    }

    async fn poll_until_live(&self, url: &str) {
        let mut delays = self.backoff.build();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.poll_once(url).await {
                Ok(()) => {
                    tracing::info!(attempt, "sidecar is live");
                    return;
                }
                Err(e) => tracing::info!(attempt, error = %e, "polling sidecar, not ready"),
            }
            let delay = delays.next().unwrap_or(MAX_POLL_INTERVAL);
            tokio::time::sleep(delay).await;
        }
    }

    async fn poll_once(&self, url: &str) -> Result<(), PollError> {
        let info: ServerInfo = self
            .client
            .get(url)
            .timeout(POLL_REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if info.state == LIVE_STATE {
            Ok(())
        } else {
            Err(PollError::NotLive(info.state))
        }
    }
}
