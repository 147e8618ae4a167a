//! Link session for the smart cart
//! Owns the connection state machine to one peripheral and wires the event
//! channel, command channel and recovery handler to it while connected.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::BoxStream;
use log::{error, info, warn};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::link_config::LinkConfig;
use crate::core::bluetooth::commands::{CartCommand, CommandChannel};
use crate::core::bluetooth::connection::ConnectionManager;
use crate::core::bluetooth::error::LinkError;
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::notifier::Notifier;
use crate::core::bluetooth::recovery::RecoveryGuard;
use crate::core::bluetooth::scanner::CartScanner;
use crate::core::bluetooth::telemetry::TelemetryWatcher;
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::{
    GpsSample, LinkEvent, LinkHandle, LinkState, PeripheralRef, PermissionState,
};
use crate::core::cart::SharedLedger;
use crate::core::services::InventoryLookup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Requested,
    Unsolicited,
}

/// Everything that only exists while connected
struct ActiveLink {
    epoch: u64,
    handle: LinkHandle,
    commands: CommandChannel,
    /// Parent of the notification and writer cancellation tokens
    cancel_token: CancellationToken,
    notification_task: JoinHandle<()>,
    recovery: RecoveryGuard,
    telemetry: Option<TelemetryWatcher>,
}

impl ActiveLink {
    fn shut_down(mut self) {
        self.recovery.disarm();
        if let Some(watcher) = self.telemetry.take() {
            watcher.stop();
        }
        self.cancel_token.cancel();
        // The handler only mutates the cart between suspension points, so
        // aborting cannot leave a half-applied scan behind
        self.notification_task.abort();
    }
}

struct SessionState {
    phase: LinkState,
    permission: PermissionState,
    scanner: CartScanner,
    active: Option<ActiveLink>,
}

struct SessionInner {
    transport: Arc<dyn Transport>,
    config: LinkConfig,
    ledger: SharedLedger,
    notifier: Notifier,
    notification_handler: NotificationHandler,
    state: Mutex<SessionState>,
    epochs: AtomicU64,
}

/// Link session; clones share the same session
#[derive(Clone)]
pub struct LinkSession {
    inner: Arc<SessionInner>,
}

impl LinkSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        inventory: Arc<dyn InventoryLookup>,
        ledger: SharedLedger,
        config: LinkConfig,
        notifier: Notifier,
    ) -> Self {
        let scanner = CartScanner::new(notifier.clone(), config.require_name);
        let notification_handler =
            NotificationHandler::new(ledger.clone(), inventory, notifier.clone());
        Self {
            inner: Arc::new(SessionInner {
                transport,
                config,
                ledger,
                notifier,
                notification_handler,
                state: Mutex::new(SessionState {
                    phase: LinkState::Idle,
                    permission: PermissionState::Unknown,
                    scanner,
                    active: None,
                }),
                epochs: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.notifier.subscribe()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.inner.ledger
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub async fn state(&self) -> LinkState {
        self.inner.state.lock().await.phase
    }

    pub async fn permission(&self) -> PermissionState {
        self.inner.state.lock().await.permission
    }

    pub async fn set_permission(&self, permission: PermissionState) {
        let mut state = self.inner.state.lock().await;
        if state.permission != permission {
            info!("Location permission is now {:?}", permission);
            state.permission = permission;
            self.inner
                .notifier
                .emit(LinkEvent::PermissionChanged(permission));
        }
    }

    /// The live link, if connected
    pub async fn link_handle(&self) -> Option<LinkHandle> {
        let state = self.inner.state.lock().await;
        state.active.as_ref().map(|active| active.handle.clone())
    }

    pub async fn peripherals(&self) -> Vec<PeripheralRef> {
        self.inner.state.lock().await.scanner.peripherals()
    }

    /// Looks a discovered peripheral up by identifier or name
    pub async fn find_peripheral(&self, query: &str) -> Option<PeripheralRef> {
        self.inner.state.lock().await.scanner.find(query)
    }

    fn set_phase(&self, state: &mut SessionState, phase: LinkState) {
        if state.phase != phase {
            info!("Link state {:?} -> {:?}", state.phase, phase);
            state.phase = phase;
            self.inner.notifier.emit(LinkEvent::StateChanged(phase));
        }
    }

    async fn restart_scan_locked(&self, state: &mut SessionState) -> Result<(), LinkError> {
        if state.permission != PermissionState::Granted {
            return Err(LinkError::PermissionDenied);
        }
        match self.inner.transport.scan().await {
            Ok(advertisements) => {
                state.scanner.start(advertisements).await;
                self.set_phase(state, LinkState::Scanning);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start scanning: {}", e);
                state.scanner.stop().await;
                self.set_phase(state, LinkState::Idle);
                Err(LinkError::ScanError(e.to_string()))
            }
        }
    }

    /// Goes back to scanning after a failure or teardown, or to idle when that is not possible
    async fn resume_scanning_locked(&self, state: &mut SessionState) {
        if let Err(e) = self.restart_scan_locked(state).await {
            warn!("Not resuming scan: {}", e);
            self.set_phase(state, LinkState::Idle);
        }
    }

    /// Starts (or restarts) listening for carts. The peripheral list starts empty.
    pub async fn start_scan(&self) -> Result<(), LinkError> {
        let mut state = self.inner.state.lock().await;
        if !state.phase.accepts_connect() {
            return Err(LinkError::SessionBusy(state.phase));
        }
        self.restart_scan_locked(&mut state).await
    }

    pub async fn stop_scan(&self) {
        let mut state = self.inner.state.lock().await;
        if state.phase == LinkState::Scanning {
            state.scanner.stop().await;
            self.set_phase(&mut state, LinkState::Idle);
        }
    }

    /// Connects to `peripheral` and brings the link up.
    ///
    /// Rejected unless idle or scanning. On any failure the partial connection
    /// is dropped and the session goes back to scanning.
    pub async fn connect(&self, peripheral: &PeripheralRef) -> Result<LinkHandle, LinkError> {
        {
            let mut state = self.inner.state.lock().await;
            if !state.phase.accepts_connect() {
                warn!(
                    "Rejecting connection to {} while {:?}",
                    peripheral.id, state.phase
                );
                return Err(LinkError::SessionBusy(state.phase));
            }
            // Most stacks stop scanning to connect
            state.scanner.stop().await;
            self.set_phase(&mut state, LinkState::Connecting);
        }

        let transport = &self.inner.transport;
        let manager = ConnectionManager::new(transport.as_ref(), &self.inner.config);

        if let Err(e) = manager.connect(peripheral).await {
            return Err(self.fail_connect(peripheral, e, false).await);
        }

        {
            let mut state = self.inner.state.lock().await;
            self.set_phase(&mut state, LinkState::Resolving);
        }
        let handle = match manager.resolve(peripheral).await {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail_connect(peripheral, e, true).await),
        };

        info!("Setting up notifications...");
        let notifications = match transport
            .subscribe(&peripheral.id, handle.service, handle.inbound)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                let e = LinkError::connection_failed(&peripheral.id, e);
                return Err(self.fail_connect(peripheral, e, true).await);
            }
        };
        let disconnect_signal = match transport.on_disconnect(&peripheral.id).await {
            Ok(signal) => signal,
            Err(e) => {
                let e = LinkError::connection_failed(&peripheral.id, e);
                return Err(self.fail_connect(peripheral, e, true).await);
            }
        };

        let mut state = self.inner.state.lock().await;
        let epoch = self.inner.epochs.fetch_add(1, Ordering::SeqCst) + 1;

        // A newly connected cart starts empty
        self.inner.ledger.clear();
        state.scanner.clear();

        let cancel_token = CancellationToken::new();
        let notification_task = self
            .inner
            .notification_handler
            .setup_notifications(notifications, cancel_token.child_token());
        let (commands, _writer_task) = CommandChannel::spawn(
            transport.clone(),
            &handle,
            Duration::from_millis(self.inner.config.write_timeout_ms),
            self.inner.config.write_queue_capacity,
            cancel_token.child_token(),
        );

        let session = Arc::downgrade(&self.inner);
        let recovery = RecoveryGuard::register(
            disconnect_signal,
            peripheral.id.clone(),
            move || async move {
                if let Some(inner) = session.upgrade() {
                    LinkSession { inner }
                        .teardown(epoch, Teardown::Unsolicited)
                        .await;
                }
            },
        );

        state.active = Some(ActiveLink {
            epoch,
            handle: handle.clone(),
            commands,
            cancel_token,
            notification_task,
            recovery,
            telemetry: None,
        });
        self.set_phase(&mut state, LinkState::Connected);
        self.inner
            .notifier
            .emit(LinkEvent::Connected(peripheral.clone()));
        info!("Connection and setup process completed successfully");
        Ok(handle)
    }

    async fn fail_connect(
        &self,
        peripheral: &PeripheralRef,
        error: LinkError,
        drop_connection: bool,
    ) -> LinkError {
        warn!("Connection to {} failed: {}", peripheral.id, error);
        if drop_connection {
            ConnectionManager::new(self.inner.transport.as_ref(), &self.inner.config)
                .abandon(&peripheral.id)
                .await;
        }
        self.inner.notifier.emit(LinkEvent::ConnectionFailed {
            peripheral_id: peripheral.id.clone(),
            reason: error.to_string(),
        });

        let mut state = self.inner.state.lock().await;
        self.resume_scanning_locked(&mut state).await;
        error
    }

    /// Disconnects from the connected cart and goes back to scanning
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        let epoch = {
            let state = self.inner.state.lock().await;
            state
                .active
                .as_ref()
                .map(|active| active.epoch)
                .ok_or(LinkError::NotConnected)?
        };
        self.teardown(epoch, Teardown::Requested).await;
        Ok(())
    }

    /// Tears down the link of `epoch`. Returns false if that link is already gone.
    async fn teardown(&self, epoch: u64, reason: Teardown) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(active) = state.active.take_if(|active| active.epoch == epoch) else {
            return false;
        };
        self.set_phase(&mut state, LinkState::Disconnecting);

        let peripheral = active.handle.peripheral.clone();
        active.shut_down();
        info!("Link to {} released", peripheral.id);

        if let Err(e) = self.inner.transport.disconnect(&peripheral.id).await {
            warn!("Failed to disconnect from {}: {}", peripheral.id, e);
        }

        let unsolicited = reason == Teardown::Unsolicited;
        self.inner.notifier.emit(LinkEvent::Disconnected {
            peripheral_id: peripheral.id.clone(),
            unsolicited,
        });
        if unsolicited {
            self.inner.notifier.emit(LinkEvent::PeripheralLost {
                name: peripheral.display_name().to_string(),
                peripheral_id: peripheral.id,
            });
        }

        self.resume_scanning_locked(&mut state).await;
        true
    }

    async fn command_channel(&self) -> Result<CommandChannel, LinkError> {
        let state = self.inner.state.lock().await;
        match (&state.active, state.phase) {
            (Some(active), LinkState::Connected) => Ok(active.commands.clone()),
            _ => Err(LinkError::NotConnected),
        }
    }

    /// Sends a raw command token to the cart
    pub async fn send(&self, token: &str) -> Result<(), LinkError> {
        self.command_channel().await?.send_command(token).await
    }

    pub async fn send_command(&self, command: CartCommand) -> Result<(), LinkError> {
        info!("Sending command to cart: {}", command);
        self.send(command.token()).await
    }

    /// Sends one position fix, bypassing the telemetry filter
    pub async fn send_telemetry(&self, sample: GpsSample) -> Result<(), LinkError> {
        self.command_channel().await?.send_telemetry(sample).await
    }

    /// Forwards `samples` to the cart until disconnected. Replaces a running watcher.
    pub async fn start_telemetry(
        &self,
        samples: BoxStream<'static, GpsSample>,
    ) -> Result<(), LinkError> {
        let mut state = self.inner.state.lock().await;
        if state.permission != PermissionState::Granted {
            return Err(LinkError::PermissionDenied);
        }
        let Some(active) = state.active.as_mut() else {
            return Err(LinkError::NotConnected);
        };
        if let Some(previous) = active.telemetry.take() {
            previous.stop();
        }
        active.telemetry = Some(TelemetryWatcher::spawn(
            samples,
            active.commands.clone(),
            &self.inner.config.telemetry,
            self.inner.notifier.clone(),
        ));
        Ok(())
    }

    pub async fn stop_telemetry(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(watcher) = state.active.as_mut().and_then(|a| a.telemetry.take()) {
            watcher.stop();
        }
    }

    pub async fn is_telemetry_running(&self) -> bool {
        let state = self.inner.state.lock().await;
        state
            .active
            .as_ref()
            .and_then(|a| a.telemetry.as_ref())
            .map(|w| w.is_running())
            .unwrap_or(false)
    }
}
