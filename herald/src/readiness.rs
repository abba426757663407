use std::sync::Arc;

use tokio::sync::watch;

use crate::shutdown::ShutdownToken;

/// Whether the platform client is able to serve handlers yet.
///
/// Owned by the pipeline and handed to handlers through their context;
/// the platform adapter flips it when its connection becomes usable.
#[derive(Clone, Debug)]
pub struct Readiness {
    sender: Arc<watch::Sender<bool>>,
}

impl Readiness {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// A readiness value that starts out ready.
    pub fn ready() -> Self {
        let readiness = Self::new();
        readiness.mark_ready();
        readiness
    }

    pub fn mark_ready(&self) {
        if !self.sender.send_replace(true) {
            tracing::info!("platform client ready");
        }
    }

    pub fn mark_not_ready(&self) {
        if self.sender.send_replace(false) {
            tracing::warn!("platform client no longer ready");
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.sender.borrow()
    }

    /// Wait until ready.
    ///
    /// Returns `false` if `shutdown` fires first.
    pub async fn wait_ready(&self, shutdown: &ShutdownToken) -> bool {
        let mut receiver = self.sender.subscribe();
        shutdown
            .run_until_cancelled(receiver.wait_for(|ready| *ready))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}
