use embedded_hal::i2c::ErrorKind;
use thiserror::Error;

/// Step of the AHT20 measurement sequence that touched the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorStage {
    SoftReset,
    Calibrate,
    Trigger,
    ReadBack,
}

impl SensorStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SoftReset => "soft-reset",
            Self::Calibrate => "calibrate",
            Self::Trigger => "trigger",
            Self::ReadBack => "read-back",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sensor bus failure during {}: {kind}", stage.as_str())]
pub struct SensorIoError {
    pub stage: SensorStage,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to open connection: {0}")]
    Open(String),
    #[error("request failed: {0}")]
    Perform(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("publish failed: {0}")]
    Publish(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectivityError {
    #[error("wifi association failed: {0}")]
    Associate(String),
    #[error("wifi reconnect gave up after {0} attempts")]
    RetriesExhausted(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("timer service is no longer running")]
pub struct SchedulerStopped;
