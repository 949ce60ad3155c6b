pub mod aht20;
pub mod ble;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod http;
pub mod mqtt;
pub mod node;
pub mod reading;
pub mod sampler;
pub mod scheduler;
pub mod topics;

pub use aht20::Aht20;
pub use ble::{BlePeripheral, BleTransport, Characteristic, GapEvent, PeripheralState};
pub use config::{NodeConfig, PushPath};
pub use connectivity::{LinkAction, LinkEvent, ReconnectPolicy};
pub use error::{ConnectivityError, SensorIoError, TransportError};
pub use http::{HttpPusher, HttpTransport, PutRequest};
pub use mqtt::{MqttEvent, MqttMessage, MqttPublisher, MqttPusher};
pub use node::{NetworkPusher, SensorNode};
pub use reading::Reading;
pub use sampler::{ReadingCache, ReadingSource, Sampler};
pub use scheduler::{MonotonicClock, PeriodicScheduler, PeriodicTask, SchedulerHandle};
pub use topics::*;
