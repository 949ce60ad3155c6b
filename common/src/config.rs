//! Build-time configuration. Secrets come from the build environment and fall
//! back to placeholder values.

use crate::aht20::AHT20_ADDRESS;

pub const DEVICE_NAME: &str = "AHT20 Destiny";

pub const SAMPLE_INTERVAL_MS: u64 = 10_000;
pub const HTTP_PUSH_INTERVAL_MS: u64 = 10_000;
pub const MQTT_PUSH_INTERVAL_MS: u64 = 30_000;

pub const WIFI_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPath {
    Http,
    Mqtt,
}

impl PushPath {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Mqtt => "MQTT",
        }
    }

    pub fn interval_ms(self) -> u64 {
        match self {
            Self::Http => HTTP_PUSH_INTERVAL_MS,
            Self::Mqtt => MQTT_PUSH_INTERVAL_MS,
        }
    }

    fn from_build_env() -> Self {
        match option_env!("DESTINY_PUSH_PATH") {
            Some(value) if value.eq_ignore_ascii_case("mqtt") => Self::Mqtt,
            _ => Self::Http,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorConfig {
    pub i2c_address: u8,
    pub clock_hz: u32,
    pub sda_pin: i32,
    pub scl_pin: i32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            i2c_address: AHT20_ADDRESS,
            clock_hz: 100_000,
            sda_pin: 4,
            scl_pin: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleConfig {
    pub device_name: String,
    pub led_pin: i32,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            device_name: DEVICE_NAME.to_string(),
            led_pin: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub max_retries: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: option_env!("WIFI_SSID").unwrap_or("iot").to_string(),
            wifi_pass: option_env!("WIFI_PASS").unwrap_or("iotpasswd").to_string(),
            max_retries: WIFI_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudConfig {
    pub host: String,
    pub device_id: String,
    pub token: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            host: option_env!("CLOUD_HOST")
                .unwrap_or("api.allthingstalk.io")
                .to_string(),
            device_id: option_env!("CLOUD_DEVICE_ID")
                .unwrap_or("CHANGE_ME")
                .to_string(),
            token: option_env!("CLOUD_TOKEN").unwrap_or("CHANGE_ME").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub broker_uri: String,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_uri: option_env!("MQTT_BROKER_URI")
                .unwrap_or("mqtt://broker.mqttdashboard.com:1883")
                .to_string(),
            client_id: "destiny-sensor".to_string(),
        }
    }
}

impl MqttConfig {
    /// Host and port parsed from `mqtt://host[:port]`.
    pub fn broker_host_port(&self) -> Option<(String, u16)> {
        let rest = self.broker_uri.strip_prefix("mqtt://")?;
        let rest = rest.trim_end_matches('/');
        match rest.rsplit_once(':') {
            Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
            None if !rest.is_empty() => Some((rest.to_string(), 1883)),
            None => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub sensor: SensorConfig,
    pub ble: BleConfig,
    pub network: NetworkConfig,
    pub cloud: CloudConfig,
    pub mqtt: MqttConfig,
    pub push_path: PushPath,
    pub sample_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sensor: SensorConfig::default(),
            ble: BleConfig::default(),
            network: NetworkConfig::default(),
            cloud: CloudConfig::default(),
            mqtt: MqttConfig::default(),
            push_path: PushPath::from_build_env(),
            sample_interval_ms: SAMPLE_INTERVAL_MS,
        }
    }
}

impl NodeConfig {
    pub fn push_interval_ms(&self) -> u64 {
        self.push_path.interval_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cadences_match_push_path() {
        assert_eq!(PushPath::Http.interval_ms(), 10_000);
        assert_eq!(PushPath::Mqtt.interval_ms(), 30_000);
        assert_eq!(NodeConfig::default().sample_interval_ms, 10_000);
    }

    #[test]
    fn sensor_defaults_match_wiring() {
        let sensor = SensorConfig::default();
        assert_eq!(sensor.i2c_address, 0x38);
        assert_eq!(sensor.clock_hz, 100_000);
        assert_eq!((sensor.sda_pin, sensor.scl_pin), (4, 5));
    }

    #[test]
    fn broker_uri_parsing() {
        let mut mqtt = MqttConfig {
            broker_uri: "mqtt://broker.example.com:1884".into(),
            client_id: "x".into(),
        };
        assert_eq!(
            mqtt.broker_host_port(),
            Some(("broker.example.com".to_string(), 1884))
        );

        mqtt.broker_uri = "mqtt://10.0.0.2".into();
        assert_eq!(mqtt.broker_host_port(), Some(("10.0.0.2".to_string(), 1883)));

        mqtt.broker_uri = "mqtts://secure:8883".into();
        assert_eq!(mqtt.broker_host_port(), None);

        mqtt.broker_uri = "mqtt://host:notaport".into();
        assert_eq!(mqtt.broker_host_port(), None);
    }
}
