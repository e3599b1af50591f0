//! Timing constants and the device list.
//!
//! Defaults are the values the van's power monitor has run with; every one
//! can be overridden before the manager is built.

use anyhow::anyhow;

/// Advertised name of the Renogy BT-2 bridge on the DC-DC charger.
pub const DEFAULT_RENOGY_NAME: &str = "BT-TH-66F94E1C    ";
pub const DEFAULT_SOK_NAMES: [&str; 2] = ["SOK-AA12487", "SOK-AA13235"];

/// All times are in milliseconds.
#[derive(Debug, Clone)]
pub struct Timing {
    /// How long a connect or command may hold the radio before it is force-cleared
    pub response_timeout: u64,
    /// Restart scanning this often while any device is still unconnected
    pub reconnect_interval: u64,
    /// How often the health check runs
    pub health_check_interval: u64,
    /// Ignore scan matches this soon after the previous connect attempt
    pub connect_throttle: u64,
    /// Health-check misses before a device is put in backoff
    pub max_retries: u32,
    pub backoff_duration: u64,
    /// A connected device without a valid frame for this long is stale
    pub stale_after: u64,
    /// Minimum time between two commands to the same device
    pub command_interval: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            response_timeout: 15_000,
            reconnect_interval: 60_000,
            health_check_interval: 30_000,
            connect_throttle: 2_000,
            max_retries: 5,
            backoff_duration: 30 * 60 * 1000,
            stale_after: 120_000,
            command_interval: 2_000,
        }
    }
}

impl Timing {
    /// Apply `VPB_STALE_MS` and `VPB_COMMAND_INTERVAL_MS` when set.
    pub fn with_env_overrides(mut self) -> anyhow::Result<Self> {
        if let Some(stale) = env_millis("VPB_STALE_MS")? {
            self.stale_after = stale;
        }
        if let Some(interval) = env_millis("VPB_COMMAND_INTERVAL_MS")? {
            self.command_interval = interval;
        }
        Ok(self)
    }
}

fn env_millis(key: &str) -> anyhow::Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("{key}={raw:?} is not a number of milliseconds: {e}")),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    RenogyController,
    SokBattery,
}

impl DeviceFamily {
    /// Work out the family from the advertised name.
    pub fn from_name(name: &str) -> Option<Self> {
        if name.starts_with("BT-TH") {
            Some(DeviceFamily::RenogyController)
        } else if name.starts_with("SOK") {
            Some(DeviceFamily::SokBattery)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub name: String,
    pub family: DeviceFamily,
}

impl DeviceConfig {
    pub fn new(name: &str) -> anyhow::Result<Self> {
        let family = DeviceFamily::from_name(name)
            .ok_or(anyhow!("Don't know how to talk to a device named {name:?}"))?;
        Ok(Self { name: name.to_string(), family })
    }

    /// The controller plus both batteries, in the order the van registers them.
    pub fn defaults() -> Vec<Self> {
        std::iter::once(DEFAULT_RENOGY_NAME)
            .chain(DEFAULT_SOK_NAMES)
            .filter_map(|name| Self::new(name).ok())
            .collect()
    }
}

#[test]
fn test_family_from_name() {
    assert_eq!(DeviceFamily::from_name("BT-TH-66F94E1C    "), Some(DeviceFamily::RenogyController));
    assert_eq!(DeviceFamily::from_name("SOK-AA12487"), Some(DeviceFamily::SokBattery));
    assert_eq!(DeviceFamily::from_name("BT_HC6172"), None);
    assert!(DeviceConfig::new("Fridge").is_err());
}

#[test]
fn test_defaults() {
    let devices = DeviceConfig::defaults();
    assert_eq!(devices.len(), 3);
    assert_eq!(devices[0].family, DeviceFamily::RenogyController);
    assert_eq!(devices[2].name, "SOK-AA13235");

    let timing = Timing::default();
    assert_eq!(timing.backoff_duration, 1_800_000);
    assert!(timing.response_timeout < timing.health_check_interval);
}
