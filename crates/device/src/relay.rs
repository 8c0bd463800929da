//! Pump relay control via GPIO. The `gpio` feature gates the real rppal
//! driver; without it, a mock implementation tracks state in memory.

use anyhow::Result;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real relay pin (production — requires rppal + hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct RelayPin {
    pin: OutputPin,
    active_low: bool,
    on: bool,
}

#[cfg(feature = "gpio")]
impl RelayPin {
    pub fn new(pin_num: u8, active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pin = gpio.get(pin_num)?.into_output();

        // Fail-safe: ensure "OFF" at startup
        if active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }

        tracing::info!(pin = pin_num, active_low, "pump relay initialised (OFF)");
        Ok(Self {
            pin,
            active_low,
            on: false,
        })
    }

    pub fn set(&mut self, on: bool) {
        let drive_high = on != self.active_low;
        if drive_high {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        self.on = on;
        tracing::debug!(state = if on { "ON" } else { "OFF" }, "relay set");
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

// ---------------------------------------------------------------------------
// Mock relay pin (development — no hardware)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub struct RelayPin {
    pub(crate) on: bool,
}

#[cfg(not(feature = "gpio"))]
impl RelayPin {
    pub fn new(pin_num: u8, _active_low: bool) -> Result<Self> {
        tracing::info!(pin = pin_num, "mock pump relay initialised (not wired)");
        Ok(Self { on: false })
    }

    pub fn set(&mut self, on: bool) {
        self.on = on;
        tracing::debug!(state = if on { "ON" } else { "OFF" }, "mock relay set");
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_starts_off() {
        let relay = RelayPin::new(23, false).unwrap();
        assert!(!relay.is_on());
    }

    #[test]
    fn relay_set_on_then_off() {
        let mut relay = RelayPin::new(23, false).unwrap();
        relay.set(true);
        assert!(relay.is_on());
        relay.set(false);
        assert!(!relay.is_on());
    }
}
