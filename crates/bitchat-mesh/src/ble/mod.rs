//! btleplug-backed radio driver
//!
//! The node scans as a central for peers advertising the BitChat service
//! and connects to them; peripheral-side advertising goes through the
//! [`Advertiser`] trait because the capable APIs are platform-specific.
//! Each connection gets a bounded write queue drained by its own task, and
//! a notification task that reframes the byte stream into wire frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bitchat_core::{Result, TransportError};

use crate::link::{
    frame_with_length, Backoff, FrameBuffer, LinkDriver, LinkEvent, LinkEventSender, LinkId,
};

// ----------------------------------------------------------------------------
// GATT Layout
// ----------------------------------------------------------------------------

/// BitChat mesh service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xF47B5E2D_4A9E_4C5A_9B3F_8E1D2C3A4B5C);

/// Peer-to-local writes (write without response)
pub const TX_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xA1B2C3D4_E5F6_4A5B_8C9D_0E1F2A3B4C5D);

/// Local-to-peer notifies
pub const RX_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xB2C3D4E5_F6A7_4B5C_9D0E_1F2A3B4C5D6E);

/// Bytes per GATT write after ATT overhead
const WRITE_CHUNK: usize = 509;

/// Per-peer outbound write queue depth
const WRITE_QUEUE_DEPTH: usize = 128;

// ----------------------------------------------------------------------------
// Advertiser
// ----------------------------------------------------------------------------

/// Peripheral-side advertising capability
///
/// btleplug only drives the central role; hosts that can advertise plug a
/// platform implementation in here.
#[async_trait]
pub trait Advertiser: Send + Sync {
    /// Begin advertising the BitChat service
    async fn start_advertising(&self) -> Result<()>;
    /// Stop advertising
    async fn stop_advertising(&self) -> Result<()>;
}

/// Advertiser for hosts without peripheral support; scanning still works
#[derive(Debug, Default)]
pub struct NoopAdvertiser;

#[async_trait]
impl Advertiser for NoopAdvertiser {
    async fn start_advertising(&self) -> Result<()> {
        debug!("peripheral advertising unavailable on this host");
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Connection Bookkeeping
// ----------------------------------------------------------------------------

struct LinkHandle {
    writer: mpsc::Sender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

type LinkTable = Arc<RwLock<HashMap<LinkId, LinkHandle>>>;

// ----------------------------------------------------------------------------
// BLE Central Driver
// ----------------------------------------------------------------------------

/// The production [`LinkDriver`] over btleplug
pub struct BleCentral {
    advertiser: Arc<dyn Advertiser>,
    links: LinkTable,
    next_link: Arc<AtomicU64>,
    scan_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BleCentral {
    /// Create a driver with the given advertiser
    pub fn new(advertiser: Arc<dyn Advertiser>) -> Self {
        Self {
            advertiser,
            links: Arc::new(RwLock::new(HashMap::new())),
            next_link: Arc::new(AtomicU64::new(1)),
            scan_task: tokio::sync::Mutex::new(None),
        }
    }

    async fn adapter() -> Result<Adapter> {
        let manager = Manager::new().await.map_err(ble_error)?;
        let adapters = manager.adapters().await.map_err(ble_error)?;
        adapters
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::TransportUnavailable { name: "ble" }.into())
    }

    async fn run_scan_loop(
        adapter: Adapter,
        links: LinkTable,
        next_link: Arc<AtomicU64>,
        events: LinkEventSender,
    ) {
        let filter = ScanFilter {
            services: vec![SERVICE_UUID],
        };
        if let Err(err) = adapter.start_scan(filter).await {
            warn!("BLE scan failed to start: {err}");
            return;
        }
        let mut central_events = match adapter.events().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("BLE event stream unavailable: {err}");
                return;
            }
        };

        info!("BLE scanning for mesh peers");
        while let Some(event) = central_events.next().await {
            if let CentralEvent::DeviceDiscovered(id) = event {
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(err) => {
                        debug!("discovered peripheral vanished: {err}");
                        continue;
                    }
                };
                let links = Arc::clone(&links);
                let next_link = Arc::clone(&next_link);
                let events = events.clone();
                tokio::spawn(async move {
                    Self::supervise_connection(peripheral, links, next_link, events).await;
                });
            }
        }
    }

    /// Connect with exponential backoff, then service the link until it drops
    async fn supervise_connection(
        peripheral: Peripheral,
        links: LinkTable,
        next_link: Arc<AtomicU64>,
        events: LinkEventSender,
    ) {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.2);

        loop {
            match Self::attach(&peripheral, &links, &next_link, &events).await {
                Ok(link) => {
                    backoff.reset();
                    // attach() spawned the servicing tasks; wait for the
                    // peripheral to disconnect before retrying.
                    loop {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        match peripheral.is_connected().await {
                            Ok(true) => continue,
                            _ => break,
                        }
                    }
                    links.write().await.remove(&link);
                    let _ = events.send(LinkEvent::Down { link });
                }
                Err(err) => {
                    debug!("BLE connect failed: {err}");
                }
            }

            let delay = backoff.next_delay();
            tokio::time::sleep(delay).await;
            if events.is_closed() {
                return;
            }
        }
    }

    /// Connect, discover characteristics, subscribe, and register the link
    async fn attach(
        peripheral: &Peripheral,
        links: &LinkTable,
        next_link: &Arc<AtomicU64>,
        events: &LinkEventSender,
    ) -> Result<LinkId> {
        peripheral.connect().await.map_err(ble_error)?;
        peripheral.discover_services().await.map_err(ble_error)?;

        let characteristics = peripheral.characteristics();
        let tx = find_characteristic(&characteristics, TX_CHARACTERISTIC_UUID)?;
        let rx = find_characteristic(&characteristics, RX_CHARACTERISTIC_UUID)?;

        peripheral.subscribe(&rx).await.map_err(ble_error)?;

        let link = LinkId(next_link.fetch_add(1, Ordering::SeqCst));
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);

        // Writer task: drain the bounded queue into GATT writes.
        let write_peripheral = peripheral.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(chunk) = writer_rx.recv().await {
                if let Err(err) = write_peripheral
                    .write(&tx, &chunk, WriteType::WithoutResponse)
                    .await
                {
                    debug!("BLE write failed: {err}");
                    break;
                }
            }
        });

        // Notification task: reframe the notify stream into wire frames.
        let mut notifications = peripheral.notifications().await.map_err(ble_error)?;
        let notify_events = events.clone();
        let notify_task = tokio::spawn(async move {
            let mut buffer = FrameBuffer::new();
            while let Some(notification) = notifications.next().await {
                if notification.uuid != RX_CHARACTERISTIC_UUID {
                    continue;
                }
                for frame in buffer.push(&notification.value) {
                    if notify_events
                        .send(LinkEvent::Frame { link, bytes: frame })
                        .is_err()
                    {
                        return;
                    }
                }
            }
        });

        links.write().await.insert(
            link,
            LinkHandle {
                writer: writer_tx,
                tasks: vec![writer_task, notify_task],
            },
        );
        let _ = events.send(LinkEvent::Up { link });
        info!(%link, "BLE link attached");
        Ok(link)
    }

    async fn enqueue(&self, link: LinkId, frame: Vec<u8>) -> Result<()> {
        let links = self.links.read().await;
        let handle = links
            .get(&link)
            .ok_or(TransportError::LinkClosed)?;

        for chunk in frame_with_length(&frame).chunks(WRITE_CHUNK) {
            handle.writer.try_send(chunk.to_vec()).map_err(|_| {
                TransportError::SendBufferFull {
                    depth: WRITE_QUEUE_DEPTH,
                }
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl LinkDriver for BleCentral {
    async fn start(&self, events: LinkEventSender) -> Result<()> {
        let mut scan_task = self.scan_task.lock().await;
        if scan_task.is_some() {
            return Ok(());
        }

        self.advertiser.start_advertising().await?;

        let adapter = Self::adapter().await?;
        let links = Arc::clone(&self.links);
        let next_link = Arc::clone(&self.next_link);
        *scan_task = Some(tokio::spawn(async move {
            Self::run_scan_loop(adapter, links, next_link, events).await;
        }));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(task) = self.scan_task.lock().await.take() {
            task.abort();
        }
        self.advertiser.stop_advertising().await?;
        self.links.write().await.clear();
        Ok(())
    }

    async fn send_frame(&self, link: LinkId, frame: Vec<u8>) -> Result<()> {
        self.enqueue(link, frame).await
    }

    async fn broadcast_frame(&self, frame: Vec<u8>, except: Option<LinkId>) -> Result<()> {
        let targets: Vec<LinkId> = {
            let links = self.links.read().await;
            links
                .keys()
                .copied()
                .filter(|link| Some(*link) != except)
                .collect()
        };
        for link in targets {
            if let Err(err) = self.enqueue(link, frame.clone()).await {
                debug!(%link, "broadcast write skipped: {err}");
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn find_characteristic(
    characteristics: &std::collections::BTreeSet<Characteristic>,
    uuid: Uuid,
) -> Result<Characteristic> {
    characteristics
        .iter()
        .find(|characteristic| characteristic.uuid == uuid)
        .cloned()
        .ok_or_else(|| TransportError::TransportUnavailable { name: "ble" }.into())
}

fn ble_error(err: btleplug::Error) -> bitchat_core::BitchatError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        err.to_string(),
    ))
    .into()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
