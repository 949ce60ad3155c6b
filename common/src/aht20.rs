//! AHT20 temperature/humidity sensor over I2C.
//!
//! The command sequence and timing are fixed by the device: soft reset,
//! calibrate, trigger, then read six status/data bytes. One `sample()` call
//! blocks for roughly 420 ms and never retries.

use embedded_hal::{
    delay::DelayNs,
    i2c::{Error as _, I2c},
};
use log::{debug, info};

use crate::{
    error::{SensorIoError, SensorStage},
    reading::Reading,
};

pub const AHT20_ADDRESS: u8 = 0x38;

pub const CMD_SOFT_RESET: u8 = 0xBA;
pub const CMD_CALIBRATE: u8 = 0xE1;
pub const CMD_TRIGGER: u8 = 0xAC;
pub const TRIGGER_PARAM: u8 = 0x33;

pub const STATUS_BUSY: u8 = 0x80;
pub const STATUS_CALIBRATED: u8 = 0x08;

pub const SOFT_RESET_WAIT_MS: u32 = 20;
pub const CALIBRATE_WAIT_MS: u32 = 100;
pub const MEASURE_WAIT_MS: u32 = 300;

pub const FRAME_LEN: usize = 6;

/// Both measurements are 20-bit unsigned fields.
const FIELD_BITS: u32 = 20;
const FIELD_MASK: u32 = (1 << FIELD_BITS) - 1;

const HUMIDITY_FULL_SCALE_CENTI: i64 = 100 * 100;
const TEMPERATURE_FULL_SCALE_CENTI: i64 = 200 * 100;
const TEMPERATURE_OFFSET_CENTI: i64 = 50 * 100;

/// Humidity bits: byte 1, byte 2, high nibble of byte 3.
pub fn raw_humidity(frame: &[u8; FRAME_LEN]) -> u32 {
    (u32::from(frame[1]) << 12) | (u32::from(frame[2]) << 4) | (u32::from(frame[3]) >> 4)
}

/// Temperature bits: low nibble of byte 3, byte 4, byte 5.
pub fn raw_temperature(frame: &[u8; FRAME_LEN]) -> u32 {
    (u32::from(frame[3] & 0x0F) << 16) | (u32::from(frame[4]) << 8) | u32::from(frame[5])
}

/// `raw * 100 / 2^20` percent, stored x100, truncated.
pub fn humidity_centi(raw: u32) -> u16 {
    let scaled = i64::from(raw & FIELD_MASK) * HUMIDITY_FULL_SCALE_CENTI;
    (scaled >> FIELD_BITS) as u16
}

/// `raw * 200 / 2^20 - 50` degrees, stored x100, truncated toward zero.
pub fn temperature_centi(raw: u32) -> i16 {
    let scaled = i64::from(raw & FIELD_MASK) * TEMPERATURE_FULL_SCALE_CENTI
        - (TEMPERATURE_OFFSET_CENTI << FIELD_BITS);
    (scaled / (1_i64 << FIELD_BITS)) as i16
}

pub fn decode(frame: &[u8; FRAME_LEN]) -> Reading {
    Reading {
        temperature_centi: temperature_centi(raw_temperature(frame)),
        humidity_centi: humidity_centi(raw_humidity(frame)),
    }
}

pub struct Aht20<I2C, D> {
    i2c: I2C,
    delay: D,
    address: u8,
}

impl<I2C, D> Aht20<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    pub fn new(i2c: I2C, delay: D) -> Self {
        Self::with_address(i2c, delay, AHT20_ADDRESS)
    }

    pub fn with_address(i2c: I2C, delay: D, address: u8) -> Self {
        Self {
            i2c,
            delay,
            address,
        }
    }

    pub fn sample(&mut self) -> Result<Reading, SensorIoError> {
        self.write(SensorStage::SoftReset, &[CMD_SOFT_RESET])?;
        self.delay.delay_ms(SOFT_RESET_WAIT_MS);

        self.write(
            SensorStage::Calibrate,
            &[CMD_CALIBRATE, STATUS_CALIBRATED, 0x00],
        )?;
        self.delay.delay_ms(CALIBRATE_WAIT_MS);

        self.write(SensorStage::Trigger, &[CMD_TRIGGER, TRIGGER_PARAM, 0x00])?;
        self.delay.delay_ms(MEASURE_WAIT_MS);

        let mut frame = [0_u8; FRAME_LEN];
        self.i2c
            .read(self.address, &mut frame)
            .map_err(|err| SensorIoError {
                stage: SensorStage::ReadBack,
                kind: err.kind(),
            })?;

        let status = frame[0];
        debug!(
            "[AHT20] status=0x{status:02X} busy={} calibrated={}",
            status & STATUS_BUSY != 0,
            status & STATUS_CALIBRATED != 0
        );

        let reading = decode(&frame);
        info!(
            "[AHT20] Humidity: {}%, Temperature: {}°C",
            reading.humidity_decimal(),
            reading.temperature_decimal()
        );
        Ok(reading)
    }

    pub fn release(self) -> (I2C, D) {
        (self.i2c, self.delay)
    }

    fn write(&mut self, stage: SensorStage, bytes: &[u8]) -> Result<(), SensorIoError> {
        self.i2c
            .write(self.address, bytes)
            .map_err(|err| SensorIoError {
                stage,
                kind: err.kind(),
            })
    }
}
