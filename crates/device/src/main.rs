mod clock;
mod config;
mod link;
mod pump;
mod relay;
mod schedule;
mod sensor;
mod session;
mod transport;
mod update;

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use clock::{Clock, SystemClock};
use link::{AlwaysUp, LinkStatus, SysfsLink};
use pump::PumpControl;
use relay::RelayPin;
use schedule::ScheduleTable;
use sensor::SoilSensor;
use session::{Session, SessionConfig, TickCtx};
use transport::MqttTransport;
use update::FileStage;

/// Host loop period. Session, schedule, and pump are all driven from this
/// single cadence.
const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Grace period before the process exits on a restart request, so the last
/// log lines make it out.
const RESTART_GRACE: Duration = Duration::from_millis(300);

#[cfg(all(not(feature = "sim"), not(feature = "gpio")))]
compile_error!("enable either the `sim` or the `gpio` feature");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config (file + env overrides) ───────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "device.toml".to_string());
    let mut cfg = config::load(&config_path)?;
    if let Ok(host) = env::var("MQTT_HOST") {
        cfg.broker.host = host;
    }
    if let Ok(port) = env::var("MQTT_PORT") {
        if let Ok(port) = port.parse() {
            cfg.broker.port = port;
        }
    }

    info!(
        device_id = %cfg.device.device_id,
        broker = %cfg.broker.host,
        port = cfg.broker.port,
        "irrigation device starting"
    );

    // ── Adapters ────────────────────────────────────────────────────
    let clock = SystemClock::new(cfg.device.utc_offset_hours)?;
    let mut sensor = build_sensor(&cfg)?;
    let mut stage = FileStage::new(Path::new(&cfg.device.firmware_path));

    let link: Box<dyn LinkStatus> = match cfg.device.network_interface.as_deref() {
        Some(iface) => Box::new(SysfsLink::new(iface)),
        None => Box::new(AlwaysUp),
    };

    // ── Core components ─────────────────────────────────────────────
    let relay = RelayPin::new(cfg.device.pump_gpio_pin, cfg.device.relay_active_low)?;
    let mut pump = PumpControl::new(relay);
    let mut schedule = ScheduleTable::new();
    let mut session = Session::new(
        MqttTransport::new(),
        link,
        SessionConfig {
            device_id: cfg.device.device_id.clone(),
            host: cfg.broker.host.clone(),
            port: cfg.broker.port,
            username: cfg.broker.username.clone(),
            password: cfg.broker.password.clone(),
            tls: cfg.broker.tls,
        },
    );

    // ── Host loop ───────────────────────────────────────────────────
    let mut ticker = tokio::time::interval(TICK_PERIOD);
    info!("control loop started");

    loop {
        ticker.tick().await;

        let now = clock.now();
        let soil_pct = sensor.soil_moisture_percent();

        {
            let mut ctx = TickCtx {
                pump: &mut pump,
                schedule: &mut schedule,
                clock: &clock,
                stage: &mut stage,
                soil_pct,
            };
            session.tick(now, &mut ctx).await;
        }

        schedule.tick(now, soil_pct, &mut pump, session.transport());
        pump.tick(now, soil_pct, session.transport());

        if session.restart_due(now) {
            info!("restarting device");
            tokio::time::sleep(RESTART_GRACE).await;
            std::process::exit(0);
        }
    }
}

#[cfg(feature = "gpio")]
fn build_sensor(cfg: &config::Config) -> Result<Box<dyn SoilSensor>> {
    Ok(Box::new(sensor::AdcSoilSensor::new(
        cfg.sensor.i2c_addr,
        cfg.sensor.raw_dry,
        cfg.sensor.raw_wet,
    )?))
}

#[cfg(all(feature = "sim", not(feature = "gpio")))]
fn build_sensor(_cfg: &config::Config) -> Result<Box<dyn SoilSensor>> {
    Ok(Box::new(sensor::SimSensor::new(45.0)))
}
