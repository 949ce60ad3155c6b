//! Fixed-point temperature/humidity value shared by every consumer.
//!
//! Both fields are stored as integers scaled by 100 so the hot path never
//! touches floating point. Conversion to a display representation happens only
//! at a transport boundary.

pub const CENTI_SCALE: i32 = 100;

/// One sensor sample. Both fields always come from the same measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reading {
    /// Degrees Celsius x 100.
    pub temperature_centi: i16,
    /// Relative humidity percent x 100.
    pub humidity_centi: u16,
}

impl Reading {
    pub const fn new(temperature_centi: i16, humidity_centi: u16) -> Self {
        Self {
            temperature_centi,
            humidity_centi,
        }
    }

    pub fn temperature_c(&self) -> f64 {
        f64::from(self.temperature_centi) / f64::from(CENTI_SCALE)
    }

    pub fn humidity_pct(&self) -> f64 {
        f64::from(self.humidity_centi) / f64::from(CENTI_SCALE)
    }

    /// Temperature as a plain decimal string, e.g. `"23.45"` or `"-0.07"`.
    pub fn temperature_decimal(&self) -> String {
        format_centi(i32::from(self.temperature_centi))
    }

    pub fn humidity_decimal(&self) -> String {
        format_centi(i32::from(self.humidity_centi))
    }

    /// Raw little-endian characteristic value for Temperature (0x2A6E).
    pub fn temperature_frame(&self) -> [u8; 2] {
        self.temperature_centi.to_le_bytes()
    }

    /// Raw little-endian characteristic value for Humidity (0x2A6F).
    pub fn humidity_frame(&self) -> [u8; 2] {
        self.humidity_centi.to_le_bytes()
    }

    /// Rebuilds a reading from the two notification frames a central receives.
    pub fn from_frames(temperature: &[u8], humidity: &[u8]) -> Option<Self> {
        let temperature: [u8; 2] = temperature.try_into().ok()?;
        let humidity: [u8; 2] = humidity.try_into().ok()?;
        Some(Self {
            temperature_centi: i16::from_le_bytes(temperature),
            humidity_centi: u16::from_le_bytes(humidity),
        })
    }
}

fn format_centi(value: i32) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let magnitude = value.unsigned_abs();
    let scale = CENTI_SCALE.unsigned_abs();
    format!("{sign}{}.{:02}", magnitude / scale, magnitude % scale)
}
