//! [`Radio`] over the host's Bluetooth adapter.
//!
//! bluest is async while [`Radio`] is not, so every operation is spawned on
//! the tokio runtime the radio was created on and its outcome is sent back
//! through a channel that [`Radio::next_event`] drains. Characteristics are
//! discovered as part of connecting so that [`Radio::discover`] can answer
//! from what the connect task found.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use bluest::{Adapter, AdvertisingDevice, Characteristic, ConnectionEvent, Device, DeviceId, Uuid};
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::radio::{Discovery, GattProfile, Radio, RadioEvent, SubscribeMode, CCCD_UUID};

const CONNECT_TIMEOUT_S: u64 = 10;
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

type Event = RadioEvent<DeviceId>;
/// Payload and whether to wait for the write response
type QueuedWrite = (Vec<u8>, bool);
type Peers = Arc<Mutex<HashMap<DeviceId, Peer>>>;

/// Expand a 16-bit SIG short UUID.
fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | (short as u128) << 96)
}

struct Peer {
    device: Device,
    /// Feeds the peer's writer task, which sends writes one at a time in order
    writes: Option<UnboundedSender<QueuedWrite>>,
    rx: Option<Characteristic>,
    discovery: Discovery,
    /// Writer, connection watcher and notification forwarder
    tasks: Vec<JoinHandle<()>>,
}

impl Peer {
    fn new(device: Device) -> Self {
        Self { device, writes: None, rx: None, discovery: Discovery::default(), tasks: Vec::new() }
    }

    fn drop_link(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.writes = None;
        self.rx = None;
        self.discovery = Discovery::default();
    }
}

fn lock(peers: &Mutex<HashMap<DeviceId, Peer>>) -> anyhow::Result<MutexGuard<'_, HashMap<DeviceId, Peer>>> {
    peers.lock().map_err(|_| anyhow!("peer table poisoned"))
}

pub struct BluestRadio {
    runtime: Handle,
    adapter: Adapter,
    peers: Peers,
    events_tx: UnboundedSender<Event>,
    events: UnboundedReceiver<Event>,
    scan: Option<JoinHandle<()>>,
}

impl BluestRadio {
    /// Open the default adapter. Must be called from within a tokio runtime.
    pub async fn new() -> anyhow::Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or(anyhow!("Default adapter not found"))?;
        adapter.wait_available().await?;
        let (events_tx, events) = mpsc::unbounded_channel();
        Ok(Self {
            runtime: Handle::current(),
            adapter,
            peers: Arc::default(),
            events_tx,
            events,
            scan: None,
        })
    }

    fn response_characteristic(&self, address: &DeviceId) -> anyhow::Result<Characteristic> {
        let peers = lock(&self.peers)?;
        let peer = peers.get(address).ok_or(anyhow!("{address:?} is not known"))?;
        peer.rx.clone().ok_or(anyhow!("{address:?} has no response characteristic"))
    }
}

/// Run queued writes one at a time, each finishing before the next starts.
async fn drain_writes<F, Fut>(mut queue: UnboundedReceiver<QueuedWrite>, mut write: F)
where
    F: FnMut(Vec<u8>, bool) -> Fut,
    Fut: Future<Output = ()>,
{
    while let Some((data, with_response)) = queue.recv().await {
        write(data, with_response).await;
    }
}

fn spawn_writer(address: DeviceId, tx: Characteristic) -> (UnboundedSender<QueuedWrite>, JoinHandle<()>) {
    let (writes, queue) = mpsc::unbounded_channel::<QueuedWrite>();
    let task = tokio::spawn(drain_writes(queue, move |data, with_response| {
        let tx = tx.clone();
        let address = address.clone();
        async move {
            let written = if with_response {
                tx.write(&data).await
            } else {
                tx.write_without_response(&data).await
            };
            match written {
                Ok(()) => debug!("{address:?}: TX {}", hex::encode(&data)),
                Err(e) => warn!("{address:?}: write of {} failed: {e}", hex::encode(&data)),
            }
        }
    }));
    (writes, task)
}

async fn find_characteristic(device: &Device, service: u16, characteristic: u16) -> anyhow::Result<Option<Characteristic>> {
    let Some(service) = device
        .discover_services_with_uuid(short_uuid(service))
        .await?
        .into_iter()
        .next()
    else {
        return Ok(None);
    };
    Ok(service
        .discover_characteristics_with_uuid(short_uuid(characteristic))
        .await?
        .into_iter()
        .next())
}

async fn discover_link(
    device: &Device,
    profile: &GattProfile,
) -> anyhow::Result<(Option<Characteristic>, Option<Characteristic>, Discovery)> {
    let tx = find_characteristic(device, profile.tx_service, profile.tx_characteristic).await?;
    let rx = find_characteristic(device, profile.rx_service, profile.rx_characteristic).await?;
    let mut discovery = Discovery { tx_found: tx.is_some(), rx_found: rx.is_some(), ..Default::default() };

    if let Some(rx) = &rx {
        let properties = rx.properties().await?;
        discovery.can_notify = properties.notify;
        discovery.can_indicate = properties.indicate;
        let cccd = short_uuid(CCCD_UUID);
        let listed = rx.discover_descriptors().await?.iter().any(|d| d.uuid() == cccd);
        // BlueZ and CoreBluetooth do not list the CCCD of a notifiable characteristic
        discovery.cccd_found = listed || properties.notify || properties.indicate;
    }
    Ok((tx, rx, discovery))
}

async fn open_link(
    adapter: &Adapter,
    device: &Device,
    profile: &GattProfile,
) -> anyhow::Result<(Option<Characteristic>, Option<Characteristic>, Discovery)> {
    adapter.connect_device(device).await?;
    discover_link(device, profile).await
}

/// Report the link dropping, whoever dropped it.
fn watch_connection(adapter: Adapter, device: Device, events: UnboundedSender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut connection_events = match adapter.device_connection_events(&device).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("{:?}: cannot watch connection: {e}", device.id());
                return;
            }
        };
        while let Some(event) = connection_events.next().await {
            if matches!(event, ConnectionEvent::Disconnected) {
                let _ = events.send(RadioEvent::Disconnected { address: device.id() });
                return;
            }
        }
    })
}

impl Radio for BluestRadio {
    type Address = DeviceId;

    fn start_scan(&mut self) -> anyhow::Result<()> {
        if self.is_scanning() {
            return Ok(());
        }
        let adapter = self.adapter.clone();
        let peers = self.peers.clone();
        let events = self.events_tx.clone();
        info!("BLE scan started");

        self.scan = Some(self.runtime.spawn(async move {
            let mut scan = match adapter.scan(&[]).await {
                Ok(scan) => scan,
                Err(e) => {
                    warn!("scan failed: {e}");
                    let _ = events.send(RadioEvent::ScanEnded);
                    return;
                }
            };
            while let Some(AdvertisingDevice { device, adv_data, .. }) = scan.next().await {
                let name = match adv_data.local_name {
                    Some(name) => name,
                    None => match device.name() {
                        Ok(name) => name,
                        Err(_) => continue,
                    },
                };
                let id = device.id();
                if let Ok(mut peers) = peers.lock() {
                    peers.entry(id.clone()).or_insert_with(|| Peer::new(device));
                }
                if events.send(RadioEvent::scan_result(&name, id)).is_err() {
                    return;
                }
            }
            let _ = events.send(RadioEvent::ScanEnded);
        }));
        Ok(())
    }

    fn stop_scan(&mut self) -> anyhow::Result<()> {
        if let Some(scan) = self.scan.take() {
            scan.abort();
            info!("BLE scan stopped");
        }
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.scan.as_ref().is_some_and(|scan| !scan.is_finished())
    }

    fn connect(&mut self, address: &DeviceId, profile: &GattProfile) -> anyhow::Result<()> {
        let device = lock(&self.peers)?
            .get(address)
            .map(|peer| peer.device.clone())
            .ok_or(anyhow!("{address:?} has not been seen by the scanner"))?;
        let adapter = self.adapter.clone();
        let peers = self.peers.clone();
        let events = self.events_tx.clone();
        let address = address.clone();
        let profile = *profile;

        self.runtime.spawn(async move {
            let connected = open_link(&adapter, &device, &profile);
            let result = match timeout(Duration::from_secs(CONNECT_TIMEOUT_S), connected).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("timed out after {CONNECT_TIMEOUT_S} s")),
            };

            match result {
                Ok((tx, rx, discovery)) => {
                    debug!("{address:?}: discovered {discovery:?}");
                    let watcher = watch_connection(adapter, device, events.clone());
                    let writer = tx.map(|tx| spawn_writer(address.clone(), tx));
                    if let Ok(mut peers) = peers.lock() {
                        if let Some(peer) = peers.get_mut(&address) {
                            peer.rx = rx;
                            peer.discovery = discovery;
                            peer.tasks.push(watcher);
                            if let Some((writes, task)) = writer {
                                peer.writes = Some(writes);
                                peer.tasks.push(task);
                            }
                        }
                    }
                    let _ = events.send(RadioEvent::Connected { address });
                }
                Err(e) => {
                    warn!("{address:?}: connect failed: {e:#}");
                    let _ = events.send(RadioEvent::ConnectFailed { address });
                }
            }
        });
        Ok(())
    }

    fn discover(&mut self, address: &DeviceId, _profile: &GattProfile) -> anyhow::Result<Discovery> {
        lock(&self.peers)?
            .get(address)
            .map(|peer| peer.discovery)
            .ok_or(anyhow!("{address:?} is not known"))
    }

    fn subscribe(&mut self, address: &DeviceId, route: usize, mode: SubscribeMode) -> anyhow::Result<()> {
        let rx = self.response_characteristic(address)?;
        let events = self.events_tx.clone();
        let name = format!("{address:?}");
        debug!("{name}: subscribing ({mode:?}) on route {route}");

        let task = self.runtime.spawn(async move {
            let mut notifications = match rx.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("{name}: subscribe failed: {e}");
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                match notification {
                    Ok(data) => match RadioEvent::notification(route, &data) {
                        Some(event) => {
                            if events.send(event).is_err() {
                                return;
                            }
                        }
                        None => warn!("{name}: dropping {} byte notification", data.len()),
                    },
                    Err(e) => {
                        warn!("{name}: notification error: {e}");
                        return;
                    }
                }
            }
            debug!("{name}: end of notification stream");
        });

        if let Some(peer) = lock(&self.peers)?.get_mut(address) {
            peer.tasks.push(task);
        }
        Ok(())
    }

    fn write(&mut self, address: &DeviceId, data: &[u8], with_response: bool) -> anyhow::Result<()> {
        let peers = lock(&self.peers)?;
        let writes = peers
            .get(address)
            .and_then(|peer| peer.writes.as_ref())
            .ok_or(anyhow!("{address:?} has no command characteristic"))?;
        writes
            .send((data.to_vec(), with_response))
            .map_err(|_| anyhow!("{address:?}: writer has stopped"))
    }

    fn disconnect(&mut self, address: &DeviceId) -> anyhow::Result<()> {
        let device = {
            let mut peers = lock(&self.peers)?;
            let peer = peers.get_mut(address).ok_or(anyhow!("{address:?} is not known"))?;
            peer.drop_link();
            peer.device.clone()
        };
        let adapter = self.adapter.clone();
        let events = self.events_tx.clone();
        let address = address.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.disconnect_device(&device).await {
                warn!("{address:?}: disconnect failed: {e}");
            }
            let _ = events.send(RadioEvent::Disconnected { address });
        });
        Ok(())
    }

    fn next_event(&mut self) -> Option<Event> {
        self.events.try_recv().ok()
    }
}

#[test]
fn test_short_uuid() {
    assert_eq!(short_uuid(0xffd1), Uuid::parse_str("0000ffd1-0000-1000-8000-00805f9b34fb").unwrap());
    assert_eq!(short_uuid(CCCD_UUID), Uuid::parse_str("00002902-0000-1000-8000-00805f9b34fb").unwrap());
}

#[test]
fn test_writes_finish_in_queue_order() {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
    let (writes, queue) = mpsc::unbounded_channel();
    for i in 0..4u8 {
        writes.send((vec![i], true)).unwrap();
    }
    drop(writes);

    let sent = Arc::new(Mutex::new(Vec::new()));
    let log = sent.clone();
    // Later writes are quicker, so they would overtake if run side by side
    runtime.block_on(drain_writes(queue, move |data, _| {
        let log = log.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(4 - data[0] as u64)).await;
            log.lock().unwrap().push(data[0]);
        }
    }));
    assert_eq!(*sent.lock().unwrap(), vec![0, 1, 2, 3]);
}
