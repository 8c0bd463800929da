//! Irrigation schedule engine: a bounded table of pre-resolved time
//! windows, reloaded wholesale from a weekly schedule payload and evaluated
//! once per host tick.
//!
//! A slot window is consumed the first time a tick lands inside it,
//! whether or not irrigation actually starts, so each window is acted on
//! at most once per reload.

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::pump::{PumpControl, SOIL_WET_ENOUGH_PCT};
use crate::transport::Publish;

/// Fixed slot capacity; payloads with more valid slots are truncated.
pub const MAX_SLOTS: usize = 32;

/// Half-open window `[start, end)` with a target moisture threshold and a
/// suggested duration.
#[derive(Debug, Clone)]
pub struct IrrigationSlot {
    pub start: i64,
    pub end: i64,
    pub duration_min: i64,
    pub soil_ref: f32,
    pub executed: bool,
}

// ---------------------------------------------------------------------------
// Payload shape: array of day objects, each holding an array of slots
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DayEntry {
    #[serde(default)]
    slots: Vec<SlotEntry>,
}

#[derive(Debug, Deserialize)]
struct SlotEntry {
    #[serde(default)]
    decision: bool,
    #[serde(default)]
    start_ts: String,
    #[serde(default)]
    end_ts: String,
    #[serde(default)]
    duration_min: i64,
}

// ---------------------------------------------------------------------------
// Schedule table
// ---------------------------------------------------------------------------

pub struct ScheduleTable {
    slots: Vec<IrrigationSlot>,
}

impl ScheduleTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(MAX_SLOTS),
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[IrrigationSlot] {
        &self.slots
    }

    /// Replace the whole table from a weekly schedule payload. Returns the
    /// number of slots stored.
    ///
    /// Slots without `decision: true` are skipped entirely. A slot with an
    /// unparsable timestamp is dropped with a diagnostic; it never fails the
    /// load. An unparsable payload leaves the existing table untouched.
    /// The whole replace happens within this call — a concurrent tick can
    /// never observe a mix of old and new slots.
    pub fn load(&mut self, payload: &[u8], clock: &dyn Clock) -> usize {
        let days: Vec<DayEntry> = match serde_json::from_slice(payload) {
            Ok(days) => days,
            Err(e) => {
                warn!("cannot parse schedule payload: {e}");
                return self.slots.len();
            }
        };

        self.clear();

        'days: for day in &days {
            for item in &day.slots {
                if self.slots.len() >= MAX_SLOTS {
                    warn!(capacity = MAX_SLOTS, "schedule truncated at capacity");
                    break 'days;
                }
                if !item.decision {
                    debug!("skipping slot: decision=false");
                    continue;
                }

                let start = match clock.parse_timestamp(&item.start_ts) {
                    Ok(ts) => ts,
                    Err(e) => {
                        warn!(start_ts = %item.start_ts, "bad slot timestamp: {e}");
                        continue;
                    }
                };
                let end = match clock.parse_timestamp(&item.end_ts) {
                    Ok(ts) => ts,
                    Err(e) => {
                        warn!(end_ts = %item.end_ts, "bad slot timestamp: {e}");
                        continue;
                    }
                };
                if end < start {
                    warn!(start, end, "slot window ends before it starts — dropped");
                    continue;
                }

                self.slots.push(IrrigationSlot {
                    start,
                    end,
                    duration_min: item.duration_min.max(0),
                    soil_ref: SOIL_WET_ENOUGH_PCT,
                    executed: false,
                });
            }
        }

        info!(slots = self.slots.len(), "irrigation schedule loaded");
        for (i, s) in self.slots.iter().enumerate() {
            debug!(
                slot = i,
                start = s.start,
                end = s.end,
                duration_min = s.duration_min,
                "saved slot"
            );
        }
        self.slots.len()
    }

    /// Evaluate the schedule for one tick. Never starts a second irrigation
    /// while one is in progress, and acts on at most one slot per tick.
    pub fn tick(&mut self, now: i64, soil_pct: f32, pump: &mut PumpControl, link: &mut dyn Publish) {
        if pump.is_on() {
            return;
        }

        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.executed || now < slot.start || now >= slot.end {
                continue;
            }

            if soil_pct < slot.soil_ref {
                info!(
                    slot = i,
                    soil_pct,
                    soil_ref = slot.soil_ref,
                    duration_min = slot.duration_min,
                    "slot active — starting irrigation"
                );
                pump.turn_on_for(now, slot.duration_min, link);
            } else {
                info!(slot = i, soil_pct, "soil moisture OK — consuming slot without watering");
            }
            slot.executed = true;
            return;
        }
    }

    /// True if `now` falls inside any stored slot's window, regardless of
    /// execution state.
    pub fn is_watering_window(&self, now: i64) -> bool {
        self.slots.iter().any(|s| now >= s.start && now < s.end)
    }
}

impl Default for ScheduleTable {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::relay::RelayPin;
    use crate::transport::FakeTransport;

    fn pump() -> PumpControl {
        PumpControl::new(RelayPin::new(23, false).unwrap())
    }

    fn link() -> FakeTransport {
        let mut t = FakeTransport::new();
        t.connected = true;
        t
    }

    /// One day with one decided slot 06:00–06:10 UTC on 2024-03-05.
    const SINGLE_SLOT: &str = r#"[
        {"slots":[{"decision":true,"start_ts":"2024-03-05T06:00:00","end_ts":"2024-03-05T06:10:00","duration_min":10}]}
    ]"#;

    /// Epoch of 2024-03-05T06:00:00Z.
    const T: i64 = 1_709_618_400;

    fn loaded_table() -> ScheduleTable {
        let mut table = ScheduleTable::new();
        let n = table.load(SINGLE_SLOT.as_bytes(), &FixedClock::at(0));
        assert_eq!(n, 1);
        table
    }

    // -- load ----------------------------------------------------------------

    #[test]
    fn load_stores_decided_slot() {
        let table = loaded_table();
        let slot = &table.slots()[0];
        assert_eq!(slot.start, T);
        assert_eq!(slot.end, T + 600);
        assert_eq!(slot.duration_min, 10);
        assert!(!slot.executed);
    }

    #[test]
    fn load_fixes_soil_ref_at_wet_threshold() {
        // The payload carries no soil reference; every slot gets the fixed
        // sufficiently-wet threshold.
        let table = loaded_table();
        assert_eq!(table.slots()[0].soil_ref, SOIL_WET_ENOUGH_PCT);
    }

    #[test]
    fn load_skips_undecided_slots() {
        let payload = r#"[
            {"slots":[
                {"decision":false,"start_ts":"2024-03-05T06:00:00","end_ts":"2024-03-05T06:10:00","duration_min":10},
                {"start_ts":"2024-03-05T07:00:00","end_ts":"2024-03-05T07:10:00","duration_min":10}
            ]}
        ]"#;
        let mut table = ScheduleTable::new();
        assert_eq!(table.load(payload.as_bytes(), &FixedClock::at(0)), 0);
    }

    #[test]
    fn load_drops_slot_with_bad_timestamp_keeps_rest() {
        let payload = r#"[
            {"slots":[
                {"decision":true,"start_ts":"not-a-timestamp","end_ts":"2024-03-05T06:10:00","duration_min":5},
                {"decision":true,"start_ts":"2024-03-05T07:00:00","end_ts":"2024-03-05T07:10:00","duration_min":10}
            ]}
        ]"#;
        let mut table = ScheduleTable::new();
        assert_eq!(table.load(payload.as_bytes(), &FixedClock::at(0)), 1);
        assert_eq!(table.slots()[0].duration_min, 10);
    }

    #[test]
    fn load_truncates_at_capacity() {
        let mut slots = String::new();
        for i in 0..40 {
            if i > 0 {
                slots.push(',');
            }
            slots.push_str(&format!(
                r#"{{"decision":true,"start_ts":"2024-03-05T{:02}:00:00","end_ts":"2024-03-05T{:02}:30:00","duration_min":5}}"#,
                i % 24,
                i % 24
            ));
        }
        let payload = format!(r#"[{{"slots":[{slots}]}}]"#);
        let mut table = ScheduleTable::new();
        assert_eq!(table.load(payload.as_bytes(), &FixedClock::at(0)), MAX_SLOTS);
    }

    #[test]
    fn load_with_garbage_payload_keeps_existing_table() {
        let mut table = loaded_table();
        assert_eq!(table.load(b"not json at all", &FixedClock::at(0)), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn load_replaces_previous_slots_wholesale() {
        let mut table = loaded_table();
        let other = r#"[
            {"slots":[{"decision":true,"start_ts":"2024-03-06T06:00:00","end_ts":"2024-03-06T06:10:00","duration_min":7}]}
        ]"#;
        assert_eq!(table.load(other.as_bytes(), &FixedClock::at(0)), 1);
        assert_eq!(table.slots()[0].duration_min, 7);
    }

    #[test]
    fn load_resets_executed_flags() {
        let mut table = loaded_table();
        let (mut p, mut t) = (pump(), link());
        table.tick(T, 40.0, &mut p, &mut t);
        assert!(table.slots()[0].executed);

        table.load(SINGLE_SLOT.as_bytes(), &FixedClock::at(0));
        assert!(!table.slots()[0].executed);
    }

    #[test]
    fn load_drops_inverted_window() {
        let payload = r#"[
            {"slots":[{"decision":true,"start_ts":"2024-03-05T06:10:00","end_ts":"2024-03-05T06:00:00","duration_min":5}]}
        ]"#;
        let mut table = ScheduleTable::new();
        assert_eq!(table.load(payload.as_bytes(), &FixedClock::at(0)), 0);
    }

    #[test]
    fn load_day_without_slots_is_skipped() {
        let payload = r#"[{}, {"slots":[]}]"#;
        let mut table = ScheduleTable::new();
        assert_eq!(table.load(payload.as_bytes(), &FixedClock::at(0)), 0);
    }

    // -- tick ----------------------------------------------------------------

    #[test]
    fn dry_soil_in_window_starts_pump_and_consumes_slot() {
        let mut table = loaded_table();
        let (mut p, mut t) = (pump(), link());

        table.tick(T, 40.0, &mut p, &mut t);

        assert!(p.is_on());
        assert_eq!(p.state().scheduled_stop, Some(T + 600));
        assert!(table.slots()[0].executed);
    }

    #[test]
    fn wet_soil_in_window_consumes_slot_without_pump() {
        let mut table = loaded_table();
        let (mut p, mut t) = (pump(), link());

        table.tick(T, 70.0, &mut p, &mut t);

        assert!(!p.is_on());
        assert!(table.slots()[0].executed);
        assert!(t.published.is_empty(), "no pump command was issued");
    }

    #[test]
    fn slot_executes_at_most_once() {
        let mut table = loaded_table();
        let (mut p, mut t) = (pump(), link());

        table.tick(T, 70.0, &mut p, &mut t);
        table.tick(T + 60, 40.0, &mut p, &mut t);

        assert!(!p.is_on(), "consumed slot must not fire again");
    }

    #[test]
    fn tick_outside_window_does_nothing() {
        let mut table = loaded_table();
        let (mut p, mut t) = (pump(), link());

        table.tick(T - 1, 40.0, &mut p, &mut t);
        assert!(!p.is_on());
        assert!(!table.slots()[0].executed);

        table.tick(T + 600, 40.0, &mut p, &mut t); // end is exclusive
        assert!(!p.is_on());
        assert!(!table.slots()[0].executed);
    }

    #[test]
    fn tick_while_pump_running_mutates_nothing() {
        let mut table = loaded_table();
        let (mut p, mut t) = (pump(), link());
        p.turn_on(T - 100, &mut t);

        table.tick(T, 40.0, &mut p, &mut t);

        assert!(!table.slots()[0].executed, "no slot mutation while running");
    }

    #[test]
    fn only_first_matching_slot_acts_per_tick() {
        let payload = r#"[
            {"slots":[
                {"decision":true,"start_ts":"2024-03-05T06:00:00","end_ts":"2024-03-05T06:10:00","duration_min":5},
                {"decision":true,"start_ts":"2024-03-05T06:00:00","end_ts":"2024-03-05T06:10:00","duration_min":9}
            ]}
        ]"#;
        let mut table = ScheduleTable::new();
        table.load(payload.as_bytes(), &FixedClock::at(0));
        let (mut p, mut t) = (pump(), link());

        table.tick(T, 70.0, &mut p, &mut t);

        assert!(table.slots()[0].executed);
        assert!(!table.slots()[1].executed, "one slot per tick");
    }

    // -- is_watering_window --------------------------------------------------

    #[test]
    fn watering_window_is_independent_of_execution() {
        let mut table = loaded_table();
        let (mut p, mut t) = (pump(), link());

        assert!(table.is_watering_window(T));
        table.tick(T, 70.0, &mut p, &mut t);
        assert!(table.is_watering_window(T + 60), "still true after execution");
    }

    #[test]
    fn watering_window_boundaries_are_half_open() {
        let table = loaded_table();
        assert!(!table.is_watering_window(T - 1));
        assert!(table.is_watering_window(T));
        assert!(table.is_watering_window(T + 599));
        assert!(!table.is_watering_window(T + 600));
    }
}
