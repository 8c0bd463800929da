//! Command/status session: owns the MQTT connection lifecycle and routes
//! decoded inbound commands to the pump, the schedule engine, or the
//! firmware update pipeline.
//!
//! Reconnect policy: one bounded connect attempt per tick with a fixed
//! backoff after failure. When the underlying network link drops while the
//! session believes itself connected, the transport socket is torn down
//! immediately so the broker's last will fires promptly; reconnect attempts
//! are suppressed until the link returns.

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::clock::{iso_utc, Clock};
use crate::link::LinkStatus;
use crate::pump::PumpControl;
use crate::schedule::ScheduleTable;
use crate::transport::{ConnectOptions, Publish, Transport};
use crate::update::{self, FirmwareStage, HttpSource};

// ---------------------------------------------------------------------------
// Topics (stable across the fleet)
// ---------------------------------------------------------------------------

pub const TOPIC_PUMP_COMMAND: &str = "device/control/pump";
pub const TOPIC_FORCE_COMMAND: &str = "device/force/manual";
pub const TOPIC_FIRMWARE_COMMAND: &str = "upload/firmware";
pub const TOPIC_SCHEDULE_COMMAND: &str = "schedule/weekly";

pub const TOPIC_PUMP_STATUS: &str = "device/pump/status";
pub const TOPIC_SENSOR_PUSH: &str = "sensor/data/push";
pub const TOPIC_UPDATE_STATUS: &str = "upload/status";

pub fn device_status_topic(device_id: &str) -> String {
    format!("device/status/{device_id}")
}

pub fn last_will_topic(device_id: &str) -> String {
    format!("device/lastwill/{device_id}")
}

const SUBSCRIBE_TOPICS: [&str; 4] = [
    TOPIC_PUMP_COMMAND,
    TOPIC_FORCE_COMMAND,
    TOPIC_FIRMWARE_COMMAND,
    TOPIC_SCHEDULE_COMMAND,
];

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

const RECONNECT_BACKOFF_SECS: i64 = 5;
const HEARTBEAT_SECS: i64 = 5;
const TELEMETRY_SECS: i64 = 60;
const RESTART_DELAY_SECS: i64 = 1;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub device_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: bool,
}

/// Everything a tick may need to mutate, borrowed for the duration of one
/// `Session::tick` call.
pub struct TickCtx<'a> {
    pub pump: &'a mut PumpControl,
    pub schedule: &'a mut ScheduleTable,
    pub clock: &'a dyn Clock,
    pub stage: &'a mut dyn FirmwareStage,
    pub soil_pct: f32,
}

pub struct Session<T: Transport, L: LinkStatus> {
    transport: T,
    link: L,
    cfg: SessionConfig,
    status_topic: String,
    state: SessionState,
    link_was_lost: bool,
    retry_at: i64,
    last_heartbeat: i64,
    last_telemetry: i64,
    restart_at: Option<i64>,
}

impl<T: Transport, L: LinkStatus> Session<T, L> {
    pub fn new(transport: T, link: L, cfg: SessionConfig) -> Self {
        let status_topic = device_status_topic(&cfg.device_id);
        Self {
            transport,
            link,
            cfg,
            status_topic,
            state: SessionState::Disconnected,
            link_was_lost: false,
            retry_at: 0,
            last_heartbeat: 0,
            last_telemetry: 0,
            restart_at: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The session owns the connection; collaborators publish through it.
    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    /// True once a requested restart's delay has elapsed.
    pub fn restart_due(&self, now: i64) -> bool {
        self.restart_at.is_some_and(|at| now >= at)
    }

    /// Drive the session for one host tick: link supervision, connection
    /// management, heartbeat/telemetry, then inbound dispatch.
    pub async fn tick(&mut self, now: i64, ctx: &mut TickCtx<'_>) {
        if !self.link.is_up() {
            if self.state != SessionState::Disconnected {
                warn!("network link down — closing transport so the last will fires");
                self.transport.disconnect();
                self.state = SessionState::Disconnected;
                self.link_was_lost = true;
            }
            return; // no reconnect attempts until the link returns
        }

        match self.state {
            SessionState::Disconnected | SessionState::Connecting => {
                self.try_connect(now).await;
            }
            SessionState::Connected => {
                self.connected_tick(now, ctx).await;
            }
        }
    }

    async fn try_connect(&mut self, now: i64) {
        if now < self.retry_at {
            return;
        }
        self.state = SessionState::Connecting;

        if self.link_was_lost {
            // The old socket may still be half-open after a link outage.
            self.transport.disconnect();
            self.link_was_lost = false;
        }

        let opts = self.connect_options();
        match self.transport.connect(&opts).await {
            Ok(()) => {
                for topic in SUBSCRIBE_TOPICS {
                    if let Err(e) = self.transport.subscribe(topic) {
                        warn!(topic, "subscribe failed: {e}");
                    }
                }
                let topic = self.status_topic.clone();
                self.publish(&topic, &json!({"status": "online"}).to_string(), true);
                self.state = SessionState::Connected;
                self.last_heartbeat = now;
                info!(host = %self.cfg.host, "mqtt session connected");
            }
            Err(e) => {
                warn!("mqtt connect failed: {e} — retry in {RECONNECT_BACKOFF_SECS}s");
                self.retry_at = now + RECONNECT_BACKOFF_SECS;
                self.state = SessionState::Disconnected;
            }
        }
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            host: self.cfg.host.clone(),
            port: self.cfg.port,
            // Fresh suffix per attempt so a half-dead predecessor session
            // cannot shadow this one on the broker.
            client_id: format!("{}-{:04x}", self.cfg.device_id, fastrand::u16(..)),
            username: self.cfg.username.clone(),
            password: self.cfg.password.clone(),
            tls: self.cfg.tls,
            last_will_topic: last_will_topic(&self.cfg.device_id),
            last_will_payload: json!({"status": "offline"}).to_string(),
        }
    }

    async fn connected_tick(&mut self, now: i64, ctx: &mut TickCtx<'_>) {
        if now - self.last_heartbeat >= HEARTBEAT_SECS {
            let topic = self.status_topic.clone();
            self.publish(&topic, &json!({"status": "online"}).to_string(), true);
            self.last_heartbeat = now;
        }

        if now - self.last_telemetry >= TELEMETRY_SECS {
            let payload = json!({
                "deviceId": self.cfg.device_id,
                "soilMoisture": ctx.soil_pct,
                "wateringWindow": ctx.schedule.is_watering_window(now),
                "timestamp": iso_utc(now),
            });
            self.publish(TOPIC_SENSOR_PUSH, &payload.to_string(), false);
            self.last_telemetry = now;
        }

        let inbound = self.transport.process().await;
        for msg in inbound {
            self.dispatch(&msg.topic, &msg.payload, now, ctx).await;
        }

        if !self.transport.is_connected() {
            warn!("mqtt connection lost — will reconnect");
            self.state = SessionState::Disconnected;
            self.retry_at = now + RECONNECT_BACKOFF_SECS;
        }
    }

    async fn dispatch(&mut self, topic: &str, payload: &[u8], now: i64, ctx: &mut TickCtx<'_>) {
        let text = String::from_utf8_lossy(payload).into_owned();
        debug!(topic, payload = %text, "inbound message");

        match topic {
            TOPIC_PUMP_COMMAND => {
                let action = parse_action(&text);
                match action.as_str() {
                    "ON" => ctx.pump.turn_on(now, &mut self.transport),
                    "OFF" => ctx.pump.turn_off(&mut self.transport),
                    other => debug!(action = other, "ignoring unknown pump action"),
                }
                let state = if ctx.pump.is_on() { "ON" } else { "OFF" };
                let echo = json!({"source": "mqtt", "pump": state});
                self.publish(TOPIC_PUMP_STATUS, &echo.to_string(), false);
            }

            TOPIC_FORCE_COMMAND => {
                if parse_action(&text) == "RESTART" {
                    info!("restart requested");
                    self.restart_at = Some(now + RESTART_DELAY_SECS);
                }
            }

            TOPIC_FIRMWARE_COMMAND => match parse_firmware_url(&text) {
                Some(url) => self.run_update(&url, ctx).await,
                None => {
                    error!("firmware command without a 'url' field");
                    let status = json!({"status": "error", "step": "missing_url"});
                    self.publish(TOPIC_UPDATE_STATUS, &status.to_string(), false);
                }
            },

            TOPIC_SCHEDULE_COMMAND => {
                ctx.schedule.load(payload, ctx.clock);
            }

            other => debug!(topic = other, "unhandled topic"),
        }
    }

    /// Runs the update pipeline to completion. Once started nothing else
    /// happens on the device until the attempt reaches a terminal state.
    async fn run_update(&mut self, url: &str, ctx: &mut TickCtx<'_>) {
        let src = match HttpSource::new() {
            Ok(src) => src,
            Err(e) => {
                error!("cannot build http client: {e}");
                let status = json!({"status": "error", "step": "begin"});
                self.publish(TOPIC_UPDATE_STATUS, &status.to_string(), false);
                return;
            }
        };
        self.run_update_with(url, src, ctx).await;
    }

    async fn run_update_with<S: update::FetchSource>(
        &mut self,
        url: &str,
        src: S,
        ctx: &mut TickCtx<'_>,
    ) {
        match update::run(url, src, ctx.stage, &mut self.transport, ctx.clock).await {
            Ok(_) => {
                // The staged image is active; the restart is the only way
                // this attempt ends.
                self.restart_at = Some(ctx.clock.now());
            }
            Err(_) => {
                // Already reported on the update-status topic; resume
                // normal operation on the previous firmware.
            }
        }
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) {
        if let Err(e) = self.transport.publish(topic, payload, retain) {
            warn!(topic, "publish failed (dropped): {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Payload decode helpers
// ---------------------------------------------------------------------------

/// Best-effort action decode: a JSON object's `action` field, or the raw
/// payload text itself (supports plain "ON"/"OFF" commands).
pub(crate) fn parse_action(payload: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(doc) => doc
            .get("action")
            .and_then(|a| a.as_str())
            .unwrap_or_default()
            .to_string(),
        Err(_) => payload.trim().to_string(),
    }
}

/// The firmware command's required `url` field.
pub(crate) fn parse_firmware_url(payload: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(payload)
        .ok()?
        .get("url")?
        .as_str()
        .map(str::to_string)
}

// ===========================================================================
// Tests
// ===========================================================================
