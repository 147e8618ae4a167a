//! Watches for the connected cart going away on its own.

use std::future::Future;

use futures_util::future::BoxFuture;
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::error::LinkError;

/// Registration of an unsolicited-disconnect watcher for one peripheral.
/// Disarming it guarantees the handler never runs.
pub struct RecoveryGuard {
    cancel_token: CancellationToken,
}

impl RecoveryGuard {
    /// Runs `on_lost` once `signal` resolves, unless disarmed first
    pub fn register<F, Fut>(
        signal: BoxFuture<'static, ()>,
        peripheral_id: String,
        on_lost: F,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel_token = CancellationToken::new();
        let cancelled = cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {
                    debug!("Disconnect watcher for {} deregistered", peripheral_id);
                }
                _ = signal => {
                    warn!("{}", LinkError::UnsolicitedDisconnect(peripheral_id));
                    on_lost().await;
                }
            }
        });
        Self { cancel_token }
    }

    pub fn disarm(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for RecoveryGuard {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
