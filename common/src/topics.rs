pub const TOPIC_SENSOR_TEMP: &str = "/destiny/sensor/temperature";
pub const TOPIC_SENSOR_HUMIDITY: &str = "/destiny/sensor/humidity";
