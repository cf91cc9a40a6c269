//! In-process HTTP fakes for the sidecar admin and quit APIs.

use axum::Router;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Address nothing listens on; connections are refused immediately.
pub const UNREACHABLE: &str = "http://127.0.0.1:1";

/// Held by tests that raise real signals at this process or install a
/// signal relay, so they never observe each other's signals.
pub static PROCESS_SIGNALS: Mutex<()> = Mutex::const_new(());

/// Serve `router` on an ephemeral loopback port and return its base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Shared request counter handed to handlers through axum state.
#[derive(Clone, Default)]
pub struct Hits(Arc<AtomicUsize>);

impl Hits {
    pub fn record(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
