use log::{info, warn};
use serde::Serialize;

use crate::{config::CloudConfig, error::TransportError, reading::Reading};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Asset {
    Temperature,
    Humidity,
}

impl Asset {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

/// Performs one complete PUT: open, write body, read status, release.
pub trait HttpTransport {
    fn put(&mut self, request: &PutRequest) -> Result<u16, TransportError>;
}

#[derive(Debug, Serialize)]
struct AssetState {
    value: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    pub accepted: u8,
    pub dropped: u8,
}

/// Pushes each measured quantity to its own asset endpoint.
pub struct HttpPusher<T> {
    cloud: CloudConfig,
    transport: T,
}

impl<T: HttpTransport> HttpPusher<T> {
    pub fn new(cloud: CloudConfig, transport: T) -> Self {
        Self { cloud, transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Always two PUTs, temperature first. Failures are logged and the data
    /// point is dropped.
    pub fn push(&mut self, reading: &Reading) -> PushReport {
        let mut report = PushReport::default();
        for (asset, value) in [
            (Asset::Temperature, reading.temperature_c()),
            (Asset::Humidity, reading.humidity_pct()),
        ] {
            match self.put_asset(asset, value) {
                Ok(status) => {
                    info!("HTTP PUT {} status = {status}", asset.as_str());
                    report.accepted += 1;
                }
                Err(err) => {
                    warn!("HTTP PUT {} failed: {err}", asset.as_str());
                    report.dropped += 1;
                }
            }
        }
        report
    }

    pub fn build_request(&self, asset: Asset, value: f64) -> Result<PutRequest, TransportError> {
        let body = serde_json::to_vec(&AssetState { value })
            .map_err(|err| TransportError::Perform(format!("invalid body: {err}")))?;
        Ok(PutRequest {
            url: format!(
                "https://{}/device/{}/asset/{}/state",
                self.cloud.host,
                self.cloud.device_id,
                asset.as_str()
            ),
            headers: vec![
                ("Authorization", format!("Bearer {}", self.cloud.token)),
                ("Content-Type", "application/json".to_string()),
            ],
            body,
        })
    }

    fn put_asset(&mut self, asset: Asset, value: f64) -> Result<u16, TransportError> {
        let request = self.build_request(asset, value)?;
        let status = self.transport.put(&request)?;
        if (200..300).contains(&status) {
            Ok(status)
        } else {
            Err(TransportError::Status(status))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct RecordingTransport {
        requests: Vec<PutRequest>,
        responses: VecDeque<Result<u16, TransportError>>,
    }

    impl HttpTransport for RecordingTransport {
        fn put(&mut self, request: &PutRequest) -> Result<u16, TransportError> {
            self.requests.push(request.clone());
            self.responses.pop_front().unwrap_or(Ok(200))
        }
    }

    fn cloud() -> CloudConfig {
        CloudConfig {
            host: "api.example.io".to_string(),
            device_id: "dev123".to_string(),
            token: "maker:secret".to_string(),
        }
    }

    fn body_value(request: &PutRequest) -> f64 {
        let json: serde_json::Value = serde_json::from_slice(&request.body).expect("json body");
        assert_eq!(json.as_object().map(|o| o.len()), Some(1));
        json["value"].as_f64().expect("numeric value")
    }

    #[test]
    fn push_issues_two_puts_in_order() {
        let mut pusher = HttpPusher::new(cloud(), RecordingTransport::default());

        let report = pusher.push(&Reading::new(2_345, 4_821));

        assert_eq!(
            report,
            PushReport {
                accepted: 2,
                dropped: 0
            }
        );
        let requests = &pusher.transport().requests;
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0].url,
            "https://api.example.io/device/dev123/asset/temperature/state"
        );
        assert_eq!(
            requests[1].url,
            "https://api.example.io/device/dev123/asset/humidity/state"
        );
        assert_eq!(body_value(&requests[0]), 23.45);
        assert_eq!(body_value(&requests[1]), 48.21);
    }

    #[test]
    fn requests_carry_bearer_token_and_json_type() {
        let pusher = HttpPusher::new(cloud(), RecordingTransport::default());
        let request = pusher
            .build_request(Asset::Humidity, 50.0)
            .expect("request");

        assert_eq!(
            request.headers,
            vec![
                ("Authorization", "Bearer maker:secret".to_string()),
                ("Content-Type", "application/json".to_string()),
            ]
        );
        assert_eq!(String::from_utf8_lossy(&request.body), r#"{"value":50.0}"#);
    }

    #[test]
    fn negative_temperature_body() {
        let mut pusher = HttpPusher::new(cloud(), RecordingTransport::default());
        pusher.push(&Reading::new(-705, 0));
        assert_eq!(body_value(&pusher.transport().requests[0]), -7.05);
        assert_eq!(body_value(&pusher.transport().requests[1]), 0.0);
    }

    #[test]
    fn failed_put_does_not_stop_the_second() {
        let transport = RecordingTransport {
            responses: VecDeque::from([Err(TransportError::Open("ESP_ERR_HTTP_CONNECT".into()))]),
            ..Default::default()
        };
        let mut pusher = HttpPusher::new(cloud(), transport);

        let report = pusher.push(&Reading::new(1_000, 1_000));

        assert_eq!(
            report,
            PushReport {
                accepted: 1,
                dropped: 1
            }
        );
        assert_eq!(pusher.transport().requests.len(), 2);
    }

    #[test]
    fn non_success_status_is_dropped() {
        let transport = RecordingTransport {
            responses: VecDeque::from([Ok(401), Ok(204)]),
            ..Default::default()
        };
        let mut pusher = HttpPusher::new(cloud(), transport);

        let report = pusher.push(&Reading::new(1_000, 1_000));

        assert_eq!(
            report,
            PushReport {
                accepted: 1,
                dropped: 1
            }
        );
    }
}
