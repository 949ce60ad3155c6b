//! BLE peripheral lifecycle for the Environmental Sensing Service.
//!
//! The peripheral loops `Idle -> Advertising -> Connected -> Advertising`
//! for the life of the process. Connection state is only ever changed by GAP
//! events; a failed notification is logged and otherwise ignored.

use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use crate::reading::Reading;

pub const ESS_SERVICE_UUID: u16 = 0x181A;
pub const TEMPERATURE_CHAR_UUID: u16 = 0x2A6E;
pub const HUMIDITY_CHAR_UUID: u16 = 0x2A6F;

pub type ConnHandle = u16;

/// The two characteristics registered once at service registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    Temperature,
    Humidity,
}

impl Characteristic {
    pub const ALL: [Self; 2] = [Self::Temperature, Self::Humidity];

    pub fn uuid16(self) -> u16 {
        match self {
            Self::Temperature => TEMPERATURE_CHAR_UUID,
            Self::Humidity => HUMIDITY_CHAR_UUID,
        }
    }

    /// Raw value served on read and pushed on notify.
    pub fn value(self, reading: &Reading) -> [u8; 2] {
        match self {
            Self::Temperature => reading.temperature_frame(),
            Self::Humidity => reading.humidity_frame(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralState {
    Idle,
    Advertising,
    Connected,
}

impl PeripheralState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Advertising => "ADVERTISING",
            Self::Connected => "CONNECTED",
        }
    }
}

/// GAP events delivered by the BLE host context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapEvent {
    Connect { conn_handle: ConnHandle },
    Disconnect { conn_handle: ConnHandle, reason: i32 },
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BleSession {
    pub state: PeripheralState,
    pub conn_handle: Option<ConnHandle>,
}

impl BleSession {
    const fn new() -> Self {
        Self {
            state: PeripheralState::Idle,
            conn_handle: None,
        }
    }

    pub fn connected(&self) -> bool {
        self.state == PeripheralState::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    NotConnected,
    Sent { delivered: u8, failed: u8 },
}

/// Radio-side operations the state machine drives.
pub trait BleTransport {
    type Error: core::fmt::Debug;

    /// Sets the advertised name and starts undirected, general-discoverable
    /// advertising with no expiry.
    fn start_advertising(&mut self, device_name: &str) -> Result<(), Self::Error>;

    fn notify(
        &mut self,
        conn_handle: ConnHandle,
        characteristic: Characteristic,
        value: &[u8],
    ) -> Result<(), Self::Error>;

    /// Connection LED.
    fn set_indicator(&mut self, on: bool);
}

struct Inner<T> {
    transport: T,
    session: BleSession,
}

pub struct BlePeripheral<T> {
    device_name: String,
    inner: Mutex<Inner<T>>,
}

impl<T: BleTransport> BlePeripheral<T> {
    pub fn new(device_name: impl Into<String>, transport: T) -> Self {
        Self {
            device_name: device_name.into(),
            inner: Mutex::new(Inner {
                transport,
                session: BleSession::new(),
            }),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn session(&self) -> BleSession {
        self.lock().session
    }

    pub fn state(&self) -> PeripheralState {
        self.lock().session.state
    }

    /// Startup transition out of `Idle`, after the GATT service is registered.
    pub fn start(&self) -> PeripheralState {
        let mut inner = self.lock();
        self.advertise(&mut inner);
        inner.session.state
    }

    /// Re-arms advertising when an earlier attempt left the peripheral `Idle`.
    pub fn ensure_advertising(&self) -> PeripheralState {
        let mut inner = self.lock();
        if inner.session.state == PeripheralState::Idle {
            self.advertise(&mut inner);
        }
        inner.session.state
    }

    pub fn handle_event(&self, event: GapEvent) -> PeripheralState {
        let mut inner = self.lock();
        match event {
            GapEvent::Connect { conn_handle } => {
                info!("BLE connected (conn_handle={conn_handle})");
                inner.transport.set_indicator(true);
                inner.session.conn_handle = Some(conn_handle);
                inner.session.state = PeripheralState::Connected;
            }
            GapEvent::Disconnect {
                conn_handle,
                reason,
            } => {
                info!("BLE disconnected (conn_handle={conn_handle}, reason={reason})");
                if inner.session.state == PeripheralState::Advertising {
                    debug!("already advertising; disconnect ignored");
                    return inner.session.state;
                }
                if inner.session.conn_handle.is_some_and(|current| current != conn_handle) {
                    warn!(
                        "disconnect for unknown conn_handle {conn_handle}; current is {:?}",
                        inner.session.conn_handle
                    );
                }
                inner.transport.set_indicator(false);
                inner.session.conn_handle = None;
                inner.session.state = PeripheralState::Idle;
                self.advertise(&mut inner);
            }
            GapEvent::Other(kind) => {
                info!("BLE GAP event type: 0x{kind:02X}");
            }
        }
        inner.session.state
    }

    /// Pushes temperature then humidity to a connected central. Silent no-op
    /// when nobody is connected.
    pub fn notify_if_connected(&self, reading: &Reading) -> NotifyOutcome {
        let mut inner = self.lock();
        let conn_handle = match (inner.session.state, inner.session.conn_handle) {
            (PeripheralState::Connected, Some(conn_handle)) => conn_handle,
            _ => return NotifyOutcome::NotConnected,
        };

        let mut delivered = 0;
        let mut failed = 0;
        for characteristic in Characteristic::ALL {
            let value = characteristic.value(reading);
            match inner.transport.notify(conn_handle, characteristic, &value) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    failed += 1;
                    warn!("failed to notify {}: {err:?}", characteristic.as_str());
                }
            }
        }

        NotifyOutcome::Sent { delivered, failed }
    }

    pub fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock().transport)
    }

    fn advertise(&self, inner: &mut Inner<T>) {
        match inner.transport.start_advertising(&self.device_name) {
            Ok(()) => {
                inner.session.state = PeripheralState::Advertising;
                info!("BLE advertising as `{}`", self.device_name);
            }
            Err(err) => {
                inner.session.state = PeripheralState::Idle;
                warn!("can't start BLE advertising: {err:?}");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
