use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, error, info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::notifier::Notifier;
use crate::core::bluetooth::types::{LinkEvent, PeripheralRef};

/// Peripherals seen during the current scan, keyed by identifier
pub type DiscoveredPeripherals = Arc<Mutex<HashMap<String, PeripheralRef>>>;

/// Consumes advertisements and keeps the de-duplicated peripheral list
pub struct CartScanner {
    discovered: DiscoveredPeripherals,
    notifier: Notifier,
    require_name: bool,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
}

impl CartScanner {
    pub fn new(notifier: Notifier, require_name: bool) -> Self {
        Self {
            discovered: Arc::new(Mutex::new(HashMap::new())),
            notifier,
            require_name,
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_task_handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Snapshot of the peripherals found so far, oldest first
    pub fn peripherals(&self) -> Vec<PeripheralRef> {
        let mut peripherals: Vec<PeripheralRef> = self
            .discovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        peripherals.sort_by(|a, b| a.discovered_at.cmp(&b.discovered_at).then(a.id.cmp(&b.id)));
        peripherals
    }

    pub fn find(&self, query: &str) -> Option<PeripheralRef> {
        self.peripherals().into_iter().find(|p| p.matches(query))
    }

    pub fn clear(&self) {
        self.discovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Starts consuming `advertisements`, replacing any running scan
    pub async fn start(&mut self, advertisements: BoxStream<'static, PeripheralRef>) {
        if self.scan_task_handle.is_some() {
            self.stop().await;
        }
        self.clear();

        self.cancel_token = CancellationToken::new();
        let cancel_token = self.cancel_token.clone();
        let discovered = self.discovered.clone();
        let notifier = self.notifier.clone();
        let require_name = self.require_name;

        self.scan_task_handle = Some(tokio::spawn(async move {
            Self::internal_scan_task(
                advertisements,
                discovered,
                notifier,
                cancel_token,
                require_name,
            )
            .await;
        }));

        self.notifier.emit(LinkEvent::ScanStarted);
        info!("Device scan task started.");
    }

    async fn internal_scan_task(
        mut advertisements: BoxStream<'static, PeripheralRef>,
        discovered: DiscoveredPeripherals,
        notifier: Notifier,
        cancel_token: CancellationToken,
        require_name: bool,
    ) {
        loop {
            tokio::select! {
                result = advertisements.next() => {
                    match result {
                        Some(peripheral) => {
                            if require_name && peripheral.name.is_none() {
                                debug!("Skipping unnamed device {}", peripheral.id);
                                continue;
                            }
                            let is_new = {
                                let mut discovered =
                                    discovered.lock().unwrap_or_else(PoisonError::into_inner);
                                if discovered.contains_key(&peripheral.id) {
                                    false
                                } else {
                                    discovered.insert(peripheral.id.clone(), peripheral.clone());
                                    true
                                }
                            };
                            if is_new {
                                info!("Found device: ID: {}, Name: {:?}, RSSI: {:?}",
                                    peripheral.id, peripheral.name, peripheral.rssi);
                                notifier.emit(LinkEvent::PeripheralFound(peripheral));
                            }
                        }
                        None => {
                            info!("Advertisement stream has ended.");
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
    }

    /// Stops the scan task and waits for it to finish. The stream is dropped with it.
    pub async fn stop(&mut self) {
        self.cancel_token.cancel();

        if let Some(handle) = self.scan_task_handle.take() {
            info!("Stopping Bluetooth scan.");
            if let Err(e) = handle.await {
                if e.is_cancelled() {
                    info!("Scan task was cancelled.");
                } else {
                    error!("Scan task finished with an unexpected join error: {:?}", e);
                }
            }
        }
    }
}

impl Drop for CartScanner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
