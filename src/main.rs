use std::time::{Duration, Instant};

use log::info;
use van_power_ble::{BluestRadio, ConnectionManager, Device, DeviceConfig, Timing};

const POLL_INTERVAL_MS: u64 = 50;
const REPORT_INTERVAL_MS: u64 = 10_000;

/// Usage: van-power-ble [DEVICE NAME]...
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let timing = Timing::default().with_env_overrides()?;
    let names: Vec<String> = std::env::args().skip(1).collect();
    let devices = if names.is_empty() {
        DeviceConfig::defaults()
    } else {
        names
            .iter()
            .map(|name| DeviceConfig::new(name))
            .collect::<anyhow::Result<Vec<_>>>()?
    };

    let radio = BluestRadio::new().await?;
    let mut manager = ConnectionManager::new(radio, timing);
    for device in &devices {
        manager.register(device)?;
    }

    let started = Instant::now();
    let millis = || started.elapsed().as_millis() as u64;
    let mut ticker = tokio::time::interval(Duration::from_millis(POLL_INTERVAL_MS));
    let mut last_report = 0;

    manager.turn_on(millis());
    loop {
        ticker.tick().await;
        let now = millis();
        manager.poll(now);
        if now.saturating_sub(last_report) >= REPORT_INTERVAL_MS {
            last_report = now;
            report(&manager, now);
        }
    }
}

fn report(manager: &ConnectionManager<BluestRadio>, now: u64) {
    info!("link: {:?}", manager.link_summary());
    for (index, device) in manager.devices().enumerate() {
        let status = if manager.is_device_in_backoff(index, now) {
            "backoff"
        } else if !device.is_connected() {
            "offline"
        } else if !device.is_current(now) {
            "stale"
        } else {
            "online"
        };
        match device {
            Device::Renogy(charger) => info!(
                "{}: {status}: aux {:.0}% {:.1}v, alternator {:.1}v {:.2}a, solar {:.1}v {:.2}a, {:.0}Ah today, {}°C/{}°C, {}",
                device.name(),
                charger.aux_battery_soc(),
                charger.aux_battery_volts(),
                charger.alternator_volts(),
                charger.alternator_amps(),
                charger.solar_volts(),
                charger.solar_amps(),
                charger.amp_hours(),
                charger.temperature(),
                charger.battery_temperature(),
                charger.charging_state().unwrap_or("unknown state"),
            ),
            Device::Sok(battery) => info!(
                "{}: {status}: {}% {:.2}v {:.2}a, {:.1}Ah, {} cycles, {:?}°C, cmos {} dmos {} heating {} protected {}",
                device.name(),
                battery.soc(),
                battery.volts(),
                battery.amps(),
                battery.capacity(),
                battery.cycles(),
                battery.temperatures(),
                battery.is_cmos(),
                battery.is_dmos(),
                battery.is_heating(),
                battery.is_protected(),
            ),
        }
    }
}
