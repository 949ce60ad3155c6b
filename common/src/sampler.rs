use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use embedded_hal::{delay::DelayNs, i2c::I2c};
use log::warn;

use crate::{aht20::Aht20, error::SensorIoError, reading::Reading};

/// Anything that can produce one fresh reading on demand.
pub trait ReadingSource {
    fn sample(&mut self) -> Result<Reading, SensorIoError>;
}

impl<I2C, D> ReadingSource for Aht20<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    fn sample(&mut self) -> Result<Reading, SensorIoError> {
        Aht20::sample(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedReading {
    pub reading: Reading,
    pub sampled_at_ms: u64,
}

/// Last known reading, shared between the timer context and the BLE host
/// context. A reading is replaced as a whole, never field by field.
#[derive(Debug, Clone, Default)]
pub struct ReadingCache {
    inner: Arc<Mutex<Option<CachedReading>>>,
}

impl ReadingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, reading: Reading, now_ms: u64) {
        *self.lock() = Some(CachedReading {
            reading,
            sampled_at_ms: now_ms,
        });
    }

    pub fn latest(&self) -> Option<CachedReading> {
        *self.lock()
    }

    /// Latest reading, or zeroes before the first successful sample.
    pub fn reading_or_default(&self) -> Reading {
        self.latest().map(|cached| cached.reading).unwrap_or_default()
    }

    pub fn fresh(&self, now_ms: u64, max_age_ms: u64) -> Option<Reading> {
        self.latest()
            .filter(|cached| now_ms.saturating_sub(cached.sampled_at_ms) < max_age_ms)
            .map(|cached| cached.reading)
    }

    fn lock(&self) -> MutexGuard<'_, Option<CachedReading>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Sampler<S> {
    source: S,
    cache: ReadingCache,
    period_ms: u64,
    failures: u32,
}

impl<S: ReadingSource> Sampler<S> {
    pub fn new(source: S, cache: ReadingCache, period_ms: u64) -> Self {
        Self {
            source,
            cache,
            period_ms,
            failures: 0,
        }
    }

    pub fn cache(&self) -> &ReadingCache {
        &self.cache
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Reads the sensor and replaces the cached value. A bus failure is logged
    /// and leaves the previous value in place.
    pub fn refresh(&mut self, now_ms: u64) -> Option<Reading> {
        match self.source.sample() {
            Ok(reading) => {
                self.cache.store(reading, now_ms);
                Some(reading)
            }
            Err(err) => {
                self.failures = self.failures.saturating_add(1);
                warn!("sensor sample skipped: {err}");
                None
            }
        }
    }

    /// Cached reading if it is younger than one sampling period, otherwise a
    /// new sample.
    pub fn current(&mut self, now_ms: u64) -> Option<Reading> {
        match self.cache.fresh(now_ms, self.period_ms) {
            Some(reading) => Some(reading),
            None => self.refresh(now_ms),
        }
    }
}
