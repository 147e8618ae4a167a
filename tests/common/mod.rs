#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde_json::json;
use smartcart_link_lib::config::link_config::LinkConfig;
use smartcart_link_lib::core::bluetooth::{
    LinkEvent, LinkSession, Notifier, PeripheralRef, PermissionState, ServiceInfo, Transport,
    frame, receiver_stream,
};
use smartcart_link_lib::core::cart::SharedLedger;
use smartcart_link_lib::core::services::{DocumentStore, MemoryDocumentStore, StoreInventory};
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(2);

pub fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_1000_8000_00805f9b34fb)
}

pub fn cart_services() -> Vec<ServiceInfo> {
    vec![
        ServiceInfo {
            uuid: uuid16(0x180a),
            characteristics: vec![uuid16(0x2a29)],
        },
        ServiceInfo {
            uuid: uuid16(0xfff0),
            characteristics: vec![uuid16(0xfff1), uuid16(0xfff2)],
        },
    ]
}

pub fn cart_peripheral() -> PeripheralRef {
    PeripheralRef::new("cart-1", Some("CART 1".to_string()))
}

/// Scriptable in-memory transport
#[derive(Default)]
pub struct MockTransport {
    scan_tx: Mutex<Option<mpsc::Sender<PeripheralRef>>>,
    notify_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    disconnect_tx: Mutex<Option<oneshot::Sender<()>>>,
    services: Mutex<Vec<ServiceInfo>>,
    writes: Mutex<Vec<Vec<u8>>>,
    write_delay: Mutex<Duration>,
    connect_delay: Mutex<Duration>,
    discover_delay: Mutex<Duration>,
    pub scan_starts: AtomicUsize,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub fail_writes: AtomicBool,
    pub fail_scan: AtomicBool,
    pub fail_subscribe: AtomicBool,
}

impl MockTransport {
    pub fn new(services: Vec<ServiceInfo>) -> Arc<Self> {
        let transport = Self::default();
        *transport.services.lock().unwrap() = services;
        Arc::new(transport)
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    pub fn set_discover_delay(&self, delay: Duration) {
        *self.discover_delay.lock().unwrap() = delay;
    }

    pub async fn advertise(&self, peripheral: PeripheralRef) {
        let tx = self.scan_tx.lock().unwrap().clone().expect("not scanning");
        tx.send(peripheral).await.unwrap();
    }

    /// Pushes a raw payload as the cart would notify it
    pub async fn notify(&self, payload: &[u8]) {
        let tx = self.notify_sender().expect("not subscribed");
        tx.send(frame(payload)).await.unwrap();
    }

    pub fn notify_sender(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.notify_tx.lock().unwrap().clone()
    }

    /// Simulates the cart dropping the link
    pub fn drop_link(&self) {
        if let Some(tx) = self.disconnect_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn scan(&self) -> Result<BoxStream<'static, PeripheralRef>> {
        if self.fail_scan.load(Ordering::SeqCst) {
            bail!("adapter is powered off");
        }
        let (tx, rx) = mpsc::channel(16);
        *self.scan_tx.lock().unwrap() = Some(tx);
        self.scan_starts.fetch_add(1, Ordering::SeqCst);
        Ok(receiver_stream(rx))
    }

    async fn connect(&self, peripheral_id: &str) -> Result<()> {
        let delay = *self.connect_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if self.fail_connect.load(Ordering::SeqCst) {
            bail!("{} refused the connection", peripheral_id);
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn discover_services(&self, _peripheral_id: &str) -> Result<Vec<ServiceInfo>> {
        let delay = *self.discover_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        Ok(self.services.lock().unwrap().clone())
    }

    async fn write(
        &self,
        _peripheral_id: &str,
        _service: Uuid,
        _characteristic: Uuid,
        frame: &[u8],
    ) -> Result<()> {
        let delay = *self.write_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("write rejected");
        }
        self.writes.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    async fn subscribe(
        &self,
        _peripheral_id: &str,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<BoxStream<'static, Vec<u8>>> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            bail!("notifications not supported");
        }
        let (tx, rx) = mpsc::channel(16);
        *self.notify_tx.lock().unwrap() = Some(tx);
        Ok(receiver_stream(rx))
    }

    async fn on_disconnect(&self, _peripheral_id: &str) -> Result<BoxFuture<'static, ()>> {
        let (tx, rx) = oneshot::channel();
        *self.disconnect_tx.lock().unwrap() = Some(tx);
        Ok(async move {
            // A replaced signal never fires
            if rx.await.is_err() {
                futures_util::future::pending::<()>().await;
            }
        }
        .boxed())
    }

    async fn disconnect(&self, _peripheral_id: &str) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Broadcast receiver that remembers every event it has seen
pub struct EventLog {
    rx: broadcast::Receiver<LinkEvent>,
    pub seen: Vec<LinkEvent>,
}

impl EventLog {
    pub fn new(rx: broadcast::Receiver<LinkEvent>) -> Self {
        Self {
            rx,
            seen: Vec::new(),
        }
    }

    /// Waits for the next event matching `predicate`
    pub async fn wait_for(&mut self, predicate: impl Fn(&LinkEvent) -> bool) -> LinkEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = self.rx.recv().await.expect("event channel closed");
                self.seen.push(event.clone());
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Collects whatever arrives within `settle`
    pub async fn drain(&mut self, settle: Duration) {
        tokio::time::sleep(settle).await;
        while let Ok(event) = self.rx.try_recv() {
            self.seen.push(event);
        }
    }

    pub fn count(&self, predicate: impl Fn(&LinkEvent) -> bool) -> usize {
        self.seen.iter().filter(|event| predicate(event)).count()
    }
}

pub struct Fixture {
    pub transport: Arc<MockTransport>,
    pub store: Arc<MemoryDocumentStore>,
    pub ledger: SharedLedger,
    pub session: LinkSession,
    pub events: EventLog,
}

impl Fixture {
    pub async fn new(services: Vec<ServiceInfo>) -> Self {
        Self::with_config(services, LinkConfig::default()).await
    }

    pub async fn with_config(services: Vec<ServiceInfo>, config: LinkConfig) -> Self {
        let transport = MockTransport::new(services);
        let store = Arc::new(MemoryDocumentStore::new());
        store
            .put("items/P1", json!({"name": "Milk", "price": 4.5, "inventory": 2}))
            .await
            .unwrap();
        store
            .put("items/P2", json!({"name": "Bread", "price": 2.0}))
            .await
            .unwrap();
        let ledger = SharedLedger::new();
        let session = LinkSession::new(
            transport.clone(),
            Arc::new(StoreInventory::new(store.clone())),
            ledger.clone(),
            config,
            Notifier::new(),
        );
        let events = EventLog::new(session.subscribe());
        Self {
            transport,
            store,
            ledger,
            session,
            events,
        }
    }

    /// Grants permission, starts scanning and waits for the cart to show up
    pub async fn discover(&mut self) -> PeripheralRef {
        self.session.set_permission(PermissionState::Granted).await;
        self.session.start_scan().await.unwrap();
        self.transport.advertise(cart_peripheral()).await;
        match self
            .events
            .wait_for(|e| matches!(e, LinkEvent::PeripheralFound(_)))
            .await
        {
            LinkEvent::PeripheralFound(peripheral) => peripheral,
            other => panic!("unexpected event {:?}", other),
        }
    }

    pub async fn connected() -> Self {
        Self::connected_with_config(LinkConfig::default()).await
    }

    pub async fn connected_with_config(config: LinkConfig) -> Self {
        let mut fixture = Self::with_config(cart_services(), config).await;
        let peripheral = fixture.discover().await;
        fixture.session.connect(&peripheral).await.unwrap();
        fixture
    }
}
