//! Soil moisture acquisition behind a narrow trait. The control core only
//! ever sees a percentage; calibration from raw ADC counts happens here.

/// Reads the soil moisture level as a percentage (0–100, wet = high).
pub trait SoilSensor {
    fn soil_moisture_percent(&mut self) -> f32;
}

/// Convert a raw ADC reading to a moisture percentage using the dry/wet
/// calibration endpoints. Capacitive probes read *higher* when dry, so
/// `raw_dry > raw_wet`. The reading is clamped into the calibrated range.
pub fn raw_to_percent(raw: i32, raw_dry: i32, raw_wet: i32) -> f32 {
    let range = raw_dry - raw_wet;
    if range <= 0 {
        return 0.0; // degenerate calibration — avoid div-by-zero
    }
    let clamped = raw.clamp(raw_wet, raw_dry);
    let pct = (raw_dry - clamped) as f64 / range as f64 * 100.0;
    pct.clamp(0.0, 100.0) as f32
}

// ---------------------------------------------------------------------------
// Simulated sensor (development — no hardware)
// ---------------------------------------------------------------------------

/// Random-walk simulator with a slow drying drift, so schedule and pump
/// behaviour can be exercised on a workstation.
#[cfg(feature = "sim")]
pub struct SimSensor {
    pct: f32,
}

#[cfg(feature = "sim")]
impl SimSensor {
    pub fn new(start_pct: f32) -> Self {
        Self {
            pct: start_pct.clamp(0.0, 100.0),
        }
    }
}

#[cfg(feature = "sim")]
impl SoilSensor for SimSensor {
    fn soil_moisture_percent(&mut self) -> f32 {
        // ±1% jitter with a 0.05%/read drying drift.
        let noise = (fastrand::f32() - 0.5) * 2.0;
        self.pct = (self.pct + noise - 0.05).clamp(0.0, 100.0);
        self.pct
    }
}

// ---------------------------------------------------------------------------
// ADS1115 sensor (production — requires rppal + I2C wiring)
// ---------------------------------------------------------------------------

/// Single-ended ADS1115 read on AIN0: OS=1 (start), PGA=001 (±4.096 V),
/// MODE=1 (single-shot), DR=100 (128 SPS), comparator disabled.
#[cfg(feature = "gpio")]
const ADS1115_CONFIG_AIN0: u16 = 0b1_100_001_1_100_0_0_0_11;

#[cfg(feature = "gpio")]
const REG_CONVERSION: u8 = 0x00;
#[cfg(feature = "gpio")]
const REG_CONFIG: u8 = 0x01;

/// Conversion time at 128 SPS is ~7.8 ms; wait 9 ms for margin.
#[cfg(feature = "gpio")]
const CONVERSION_WAIT: std::time::Duration = std::time::Duration::from_millis(9);

#[cfg(feature = "gpio")]
pub struct AdcSoilSensor {
    i2c: rppal::i2c::I2c,
    raw_dry: i32,
    raw_wet: i32,
    last_pct: f32,
}

#[cfg(feature = "gpio")]
impl AdcSoilSensor {
    pub fn new(addr: u16, raw_dry: i32, raw_wet: i32) -> anyhow::Result<Self> {
        let mut i2c = rppal::i2c::I2c::new()?;
        i2c.set_slave_address(addr)?;
        tracing::info!(addr = format_args!("0x{addr:02x}"), "soil adc initialised");
        Ok(Self {
            i2c,
            raw_dry,
            raw_wet,
            last_pct: 0.0,
        })
    }

    fn read_raw(&mut self) -> anyhow::Result<i16> {
        self.i2c
            .block_write(REG_CONFIG, &ADS1115_CONFIG_AIN0.to_be_bytes())?;
        std::thread::sleep(CONVERSION_WAIT);
        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        Ok(i16::from_be_bytes(buf))
    }
}

#[cfg(feature = "gpio")]
impl SoilSensor for AdcSoilSensor {
    fn soil_moisture_percent(&mut self) -> f32 {
        match self.read_raw() {
            Ok(raw) => {
                self.last_pct = raw_to_percent(raw as i32, self.raw_dry, self.raw_wet);
                self.last_pct
            }
            Err(e) => {
                tracing::warn!("soil adc read failed: {e} — reusing last value");
                self.last_pct
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
