//! Shutdown cascade: after the child exits, decide whether the sidecar
//! should be stopped and, if so, try the configured strategies in order.
//!
//! Every step here is best-effort. Failures are logged and never change
//! the exit code scuttle reports.

use crate::config::Settings;
use crate::process_kill::SidecarKiller;
use reqwest::StatusCode;
use std::net::IpAddr;

/// Why the cascade decided to leave the sidecar alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoAdminUrl,
    AdminNotLocal,
    NeverKill,
    NeverKillOnFailure,
}

impl SkipReason {
    pub fn describe(self) -> &'static str {
        match self {
            SkipReason::NoAdminUrl => "ENVOY_ADMIN_API not set",
            SkipReason::AdminNotLocal => "ENVOY_ADMIN_API is not a loopback address",
            SkipReason::NeverKill => "NEVER_KILL_ISTIO is true",
            SkipReason::NeverKillOnFailure => "NEVER_KILL_ISTIO_ON_FAILURE is true and the child failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownDecision {
    Skip(SkipReason),
    /// No quit API configured; interrupt the sidecar process directly.
    SignalFallbackOnly,
    /// Call the quit API, falling back to a signal if allowed.
    ApiThenOptionalSignalFallback,
}

type Guard = fn(&Settings, i32) -> bool;

/// Skip conditions, checked in order. The first match wins.
const SKIP_GUARDS: &[(Guard, SkipReason)] = &[
    (admin_url_missing, SkipReason::NoAdminUrl),
    (admin_url_not_local, SkipReason::AdminNotLocal),
    (never_kill, SkipReason::NeverKill),
    (never_kill_on_failure, SkipReason::NeverKillOnFailure),
];

fn admin_url_missing(settings: &Settings, _exit_code: i32) -> bool {
    settings.sidecar_admin_url.is_none()
}

fn admin_url_not_local(settings: &Settings, _exit_code: i32) -> bool {
    !settings
        .sidecar_admin_url
        .as_deref()
        .is_some_and(is_loopback_url)
}

fn never_kill(settings: &Settings, _exit_code: i32) -> bool {
    settings.never_kill_sidecar
}

fn never_kill_on_failure(settings: &Settings, exit_code: i32) -> bool {
    settings.never_kill_on_failure && exit_code != 0
}

/// Pure decision over `(settings, exit_code)`.
pub fn decide(settings: &Settings, exit_code: i32) -> ShutdownDecision {
    if let Some((_, reason)) = SKIP_GUARDS
        .iter()
        .find(|(guard, _)| guard(settings, exit_code))
    {
        return ShutdownDecision::Skip(*reason);
    }

    if settings.sidecar_quit_url.is_none() {
        ShutdownDecision::SignalFallbackOnly
    } else {
        ShutdownDecision::ApiThenOptionalSignalFallback
    }
}

/// True if `url` points at this host. A missing scheme is tolerated, so
/// `127.0.0.1:15000` counts.
pub fn is_loopback_url(url: &str) -> bool {
    let parsed = reqwest::Url::parse(url)
        .ok()
        .filter(|u| u.has_host())
        .or_else(|| reqwest::Url::parse(&format!("http://{url}")).ok());

    let Some(host) = parsed.as_ref().and_then(|u| u.host_str()) else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_loopback())
}

pub struct ShutdownCascade<'a, K> {
    settings: &'a Settings,
    client: reqwest::Client,
    killer: K,
}

impl<'a, K: SidecarKiller> ShutdownCascade<'a, K> {
    pub fn new(settings: &'a Settings, client: reqwest::Client, killer: K) -> Self {
        Self {
            settings,
            client,
            killer,
        }
    }

    /// Run the cascade for a child that exited with `exit_code`.
    pub async fn run(&self, exit_code: i32) -> ShutdownDecision {
        let decision = decide(self.settings, exit_code);
        match decision {
            ShutdownDecision::Skip(reason) => {
                tracing::info!(exit_code, reason = reason.describe(), "skipping sidecar shutdown");
            }
            ShutdownDecision::SignalFallbackOnly => {
                tracing::info!(
                    exit_code,
                    reason = "ISTIO_QUIT_API not set",
                    "stopping sidecar with a signal"
                );
                self.post_generic_endpoints().await;
                self.signal_sidecar();
            }
            ShutdownDecision::ApiThenOptionalSignalFallback => {
                tracing::info!(
                    exit_code,
                    reason = "ISTIO_QUIT_API is set",
                    "stopping sidecar with the quit API"
                );
                self.post_generic_endpoints().await;
                if !self.quit_via_api().await && self.settings.quit_api_fallback_to_signal {
                    tracing::info!("quit API failed, falling back to a signal");
                    self.signal_sidecar();
                }
            }
        }
        decision
    }

    /// POST to every generic endpoint. One failure never stops the rest.
    async fn post_generic_endpoints(&self) {
        for endpoint in &self.settings.generic_quit_endpoints {
            let endpoint = endpoint.trim();
            match self.client.post(endpoint).send().await {
                Ok(resp) => {
                    tracing::info!(endpoint, status = resp.status().as_u16(), "sent POST to quit endpoint");
                }
                Err(e) => {
                    tracing::warn!(endpoint, error = %e, "POST to quit endpoint failed");
                }
            }
        }
    }

    /// POST `{quit}/quitquitquit`. Only a 200 counts as success.
    async fn quit_via_api(&self) -> bool {
        let Some(quit_url) = self.settings.sidecar_quit_url.as_deref() else {
            return false;
        };
        let url = format!("{}/quitquitquit", quit_url.trim_end_matches('/'));

        match self.client.post(&url).send().await {
            Ok(resp) if resp.status() == StatusCode::OK => {
                tracing::info!(url, "sidecar accepted quitquitquit");
                true
            }
            Ok(resp) => {
                tracing::warn!(url, status = resp.status().as_u16(), "quitquitquit was rejected");
                false
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "quitquitquit request failed");
                false
            }
        }
    }

    fn signal_sidecar(&self) {
        match self.killer.interrupt() {
            Ok(count) => tracing::info!(count, "sidecar interrupted"),
            Err(e) => tracing::warn!(error = %e, "sidecar could not be stopped"),
        }
    }
}
