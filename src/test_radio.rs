//! An in-memory radio for driving the connection manager in tests.

use std::collections::{HashMap, VecDeque};

use anyhow::anyhow;

use crate::radio::{Discovery, GattProfile, Radio, RadioEvent, SubscribeMode};

pub type Address = [u8; 6];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan,
    StopScan,
    Connect(Address),
    Discover(Address),
    Subscribe(Address, usize, SubscribeMode),
    Write(Address, Vec<u8>, bool),
    Disconnect(Address),
}

/// Records every call. Connects and disconnects complete on the next poll
/// unless the test says otherwise.
#[derive(Debug)]
pub struct TestRadio {
    pub calls: Vec<Call>,
    pub events: VecDeque<RadioEvent<Address>>,
    pub scanning: bool,
    /// Queue `Connected` in response to `connect`
    pub complete_connects: bool,
    pub fail_subscribe: bool,
    pub fail_writes: bool,
    /// What discovery reports, per peer; peers not listed get everything
    pub discoveries: HashMap<Address, Discovery>,
}

impl TestRadio {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            events: VecDeque::new(),
            scanning: false,
            complete_connects: true,
            fail_subscribe: false,
            fail_writes: false,
            discoveries: HashMap::new(),
        }
    }

    pub fn advertise(&mut self, name: &str, address: Address) {
        self.events.push_back(RadioEvent::scan_result(name, address));
    }

    pub fn notify(&mut self, route: usize, data: &[u8]) {
        if let Some(event) = RadioEvent::notification(route, data) {
            self.events.push_back(event);
        }
    }

    pub fn drop_link(&mut self, address: Address) {
        self.events.push_back(RadioEvent::Disconnected { address });
    }

    pub fn writes_to(&self, address: Address) -> Vec<Vec<u8>> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Write(a, data, _) if *a == address => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &Call) -> usize {
        self.calls.iter().filter(|call| *call == wanted).count()
    }

    pub fn connects(&self) -> usize {
        self.calls.iter().filter(|call| matches!(call, Call::Connect(_))).count()
    }
}

fn full_discovery() -> Discovery {
    Discovery { tx_found: true, rx_found: true, cccd_found: true, can_notify: true, can_indicate: false }
}

impl Radio for TestRadio {
    type Address = Address;

    fn start_scan(&mut self) -> anyhow::Result<()> {
        self.calls.push(Call::StartScan);
        self.scanning = true;
        Ok(())
    }

    fn stop_scan(&mut self) -> anyhow::Result<()> {
        self.calls.push(Call::StopScan);
        self.scanning = false;
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.scanning
    }

    fn connect(&mut self, address: &Address, _profile: &GattProfile) -> anyhow::Result<()> {
        self.calls.push(Call::Connect(*address));
        if self.complete_connects {
            self.events.push_back(RadioEvent::Connected { address: *address });
        }
        Ok(())
    }

    fn discover(&mut self, address: &Address, _profile: &GattProfile) -> anyhow::Result<Discovery> {
        self.calls.push(Call::Discover(*address));
        Ok(self.discoveries.get(address).copied().unwrap_or_else(full_discovery))
    }

    fn subscribe(&mut self, address: &Address, route: usize, mode: SubscribeMode) -> anyhow::Result<()> {
        self.calls.push(Call::Subscribe(*address, route, mode));
        if self.fail_subscribe {
            return Err(anyhow!("subscribe rejected"));
        }
        Ok(())
    }

    fn write(&mut self, address: &Address, data: &[u8], with_response: bool) -> anyhow::Result<()> {
        self.calls.push(Call::Write(*address, data.to_vec(), with_response));
        if self.fail_writes {
            return Err(anyhow!("write rejected"));
        }
        Ok(())
    }

    fn disconnect(&mut self, address: &Address) -> anyhow::Result<()> {
        self.calls.push(Call::Disconnect(*address));
        self.events.push_back(RadioEvent::Disconnected { address: *address });
        Ok(())
    }

    fn next_event(&mut self) -> Option<RadioEvent<Address>> {
        self.events.pop_front()
    }
}
