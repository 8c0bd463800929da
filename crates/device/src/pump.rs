//! Pump control: the exclusive owner of the actuator.
//!
//! Two durable states, OFF and ON, with an optional scheduled-stop sub-mode
//! of ON. Every *actual* transition publishes `{"pump":"ON"|"OFF"}`; no-op
//! calls publish nothing. The runtime ceiling in `tick` is the last line of
//! defense against a stuck command or runaway schedule and cannot be
//! configured away.

use serde_json::json;
use tracing::{info, warn};

use crate::relay::RelayPin;
use crate::session::TOPIC_PUMP_STATUS;
use crate::transport::Publish;

/// Moisture percentage above which irrigation is considered unnecessary.
pub const SOIL_WET_ENOUGH_PCT: f32 = 60.0;

/// Hard maximum continuous runtime, independent of any schedule or command.
pub const MAX_RUNTIME_SECS: i64 = 20 * 60;

/// Invariant: `running == false` implies `scheduled_stop == None`.
#[derive(Debug, Clone)]
pub struct PumpState {
    pub running: bool,
    pub started_at: i64,
    pub scheduled_stop: Option<i64>,
}

pub struct PumpControl {
    relay: RelayPin,
    state: PumpState,
}

impl PumpControl {
    pub fn new(relay: RelayPin) -> Self {
        Self {
            relay,
            state: PumpState {
                running: false,
                started_at: 0,
                scheduled_stop: None,
            },
        }
    }

    pub fn is_on(&self) -> bool {
        self.state.running
    }

    pub fn state(&self) -> &PumpState {
        &self.state
    }

    /// No-op if already on. Clears any previous scheduled stop.
    pub fn turn_on(&mut self, now: i64, link: &mut dyn Publish) {
        if self.state.running {
            return;
        }
        self.relay.set(true);
        self.state = PumpState {
            running: true,
            started_at: now,
            scheduled_stop: None,
        };
        info!("pump ON");
        self.publish_status(link);
    }

    /// Turn on (if not already running) and stop after `minutes`.
    pub fn turn_on_for(&mut self, now: i64, minutes: i64, link: &mut dyn Publish) {
        self.turn_on(now, link);
        self.state.scheduled_stop = Some(now + minutes * 60);
    }

    /// No-op if already off.
    pub fn turn_off(&mut self, link: &mut dyn Publish) {
        if !self.state.running {
            return;
        }
        self.relay.set(false);
        self.state = PumpState {
            running: false,
            started_at: 0,
            scheduled_stop: None,
        };
        info!("pump OFF");
        self.publish_status(link);
    }

    pub fn toggle(&mut self, now: i64, link: &mut dyn Publish) {
        if self.state.running {
            self.turn_off(link);
        } else {
            self.turn_on(now, link);
        }
    }

    /// Auto-stop evaluation, called once per host tick. Stop rules in fixed
    /// priority order; the first match wins.
    pub fn tick(&mut self, now: i64, soil_pct: f32, link: &mut dyn Publish) {
        if !self.state.running {
            return;
        }

        if soil_pct >= SOIL_WET_ENOUGH_PCT {
            info!(soil_pct, "soil wet enough — stopping pump");
            self.turn_off(link);
            return;
        }

        if let Some(stop_at) = self.state.scheduled_stop {
            if now >= stop_at {
                info!("scheduled stop reached — stopping pump");
                self.turn_off(link);
                return;
            }
        }

        if now - self.state.started_at >= MAX_RUNTIME_SECS {
            warn!(
                elapsed_secs = now - self.state.started_at,
                "runtime ceiling exceeded — forcing pump off"
            );
            self.turn_off(link);
        }
    }

    fn publish_status(&mut self, link: &mut dyn Publish) {
        let payload = json!({ "pump": if self.state.running { "ON" } else { "OFF" } });
        if let Err(e) = link.publish(TOPIC_PUMP_STATUS, &payload.to_string(), false) {
            warn!("pump status publish failed (dropped): {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FakeTransport;

    fn pump() -> PumpControl {
        PumpControl::new(RelayPin::new(23, false).unwrap())
    }

    fn link() -> FakeTransport {
        let mut t = FakeTransport::new();
        t.connected = true;
        t
    }

    // -- transitions ---------------------------------------------------------

    #[test]
    fn turn_on_activates_and_publishes_once() {
        let (mut p, mut t) = (pump(), link());
        p.turn_on(100, &mut t);
        assert!(p.is_on());
        assert_eq!(p.state().started_at, 100);
        assert_eq!(t.published.len(), 1);
        assert_eq!(t.published[0].0, TOPIC_PUMP_STATUS);
        assert_eq!(t.published[0].1, r#"{"pump":"ON"}"#);
    }

    #[test]
    fn turn_on_when_already_on_is_a_noop() {
        let (mut p, mut t) = (pump(), link());
        p.turn_on(100, &mut t);
        p.turn_on(150, &mut t);
        assert_eq!(p.state().started_at, 100, "started_at must not move");
        assert_eq!(t.published.len(), 1, "no publish for a no-op call");
    }

    #[test]
    fn turn_off_when_already_off_is_a_noop() {
        let (mut p, mut t) = (pump(), link());
        p.turn_off(&mut t);
        assert!(!p.is_on());
        assert!(t.published.is_empty(), "no publish for a no-op call");
    }

    #[test]
    fn turn_off_clears_both_time_fields() {
        let (mut p, mut t) = (pump(), link());
        p.turn_on_for(100, 10, &mut t);
        p.turn_off(&mut t);
        assert!(!p.is_on());
        assert_eq!(p.state().started_at, 0);
        assert_eq!(p.state().scheduled_stop, None);
    }

    #[test]
    fn toggle_inverts_state() {
        let (mut p, mut t) = (pump(), link());
        p.toggle(100, &mut t);
        assert!(p.is_on());
        p.toggle(101, &mut t);
        assert!(!p.is_on());
        assert_eq!(t.published.len(), 2);
    }

    #[test]
    fn publish_count_equals_actual_transitions_not_calls() {
        let (mut p, mut t) = (pump(), link());
        p.turn_on(1, &mut t);
        p.turn_on(2, &mut t);
        p.turn_off(&mut t);
        p.turn_off(&mut t);
        p.toggle(5, &mut t);
        p.turn_on(6, &mut t);
        p.turn_off(&mut t);
        // Transitions: on, off, on (toggle), off.
        assert_eq!(t.published.len(), 4);
    }

    #[test]
    fn turn_on_for_sets_scheduled_stop() {
        let (mut p, mut t) = (pump(), link());
        p.turn_on_for(100, 10, &mut t);
        assert_eq!(p.state().scheduled_stop, Some(100 + 600));
    }

    #[test]
    fn turn_on_for_while_running_updates_stop_without_publish() {
        let (mut p, mut t) = (pump(), link());
        p.turn_on(100, &mut t);
        p.turn_on_for(200, 5, &mut t);
        assert_eq!(p.state().scheduled_stop, Some(200 + 300));
        assert_eq!(p.state().started_at, 100);
        assert_eq!(t.published.len(), 1);
    }

    #[test]
    fn failed_publish_is_dropped_not_fatal() {
        let mut p = pump();
        let mut t = FakeTransport::new(); // disconnected — publishes fail
        p.turn_on(100, &mut t);
        assert!(p.is_on(), "state transition survives a failed publish");
        assert!(t.published.is_empty());
    }

    // -- tick stop rules -----------------------------------------------------

    #[test]
    fn tick_while_off_does_nothing() {
        let (mut p, mut t) = (pump(), link());
        p.tick(100, 10.0, &mut t);
        assert!(!p.is_on());
        assert!(t.published.is_empty());
    }

    #[test]
    fn tick_stops_when_soil_wet_enough() {
        let (mut p, mut t) = (pump(), link());
        p.turn_on(100, &mut t);
        p.tick(101, SOIL_WET_ENOUGH_PCT, &mut t);
        assert!(!p.is_on());
    }

    #[test]
    fn tick_keeps_running_below_threshold() {
        let (mut p, mut t) = (pump(), link());
        p.turn_on(100, &mut t);
        p.tick(101, 40.0, &mut t);
        assert!(p.is_on());
    }

    #[test]
    fn tick_stops_at_scheduled_stop() {
        let (mut p, mut t) = (pump(), link());
        p.turn_on_for(100, 10, &mut t);
        p.tick(699, 10.0, &mut t);
        assert!(p.is_on(), "one second early — still running");
        p.tick(700, 10.0, &mut t);
        assert!(!p.is_on());
    }

    #[test]
    fn tick_enforces_runtime_ceiling() {
        let (mut p, mut t) = (pump(), link());
        p.turn_on(0, &mut t);
        p.tick(MAX_RUNTIME_SECS - 1, 10.0, &mut t);
        assert!(p.is_on());
        p.tick(MAX_RUNTIME_SECS, 10.0, &mut t);
        assert!(!p.is_on());
    }

    #[test]
    fn ceiling_applies_even_with_later_scheduled_stop() {
        let (mut p, mut t) = (pump(), link());
        // Scheduled stop at 30 min, well past the 20 min ceiling.
        p.turn_on_for(0, 30, &mut t);
        p.tick(MAX_RUNTIME_SECS, 10.0, &mut t);
        assert!(!p.is_on(), "ceiling must win over the scheduled stop");
    }

    #[test]
    fn soil_rule_outranks_scheduled_stop() {
        let (mut p, mut t) = (pump(), link());
        p.turn_on_for(100, 10, &mut t);
        // Both rules match; either way the pump must stop.
        p.tick(700, 80.0, &mut t);
        assert!(!p.is_on());
    }

    // -- invariant -----------------------------------------------------------

    #[test]
    fn stopped_pump_never_keeps_a_scheduled_stop() {
        let (mut p, mut t) = (pump(), link());
        p.turn_on_for(0, 30, &mut t);
        p.tick(MAX_RUNTIME_SECS, 10.0, &mut t);
        assert!(!p.state().running);
        assert_eq!(p.state().scheduled_stop, None);
    }
}
