use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_hal::{
    delay::DelayNs,
    i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation},
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tracing::{info, warn};

use destiny_common::{
    aht20::{AHT20_ADDRESS, CMD_TRIGGER, FRAME_LEN, STATUS_CALIBRATED},
    ble::ConnHandle,
    mqtt::Delivery,
    Aht20, BlePeripheral, BleTransport, Characteristic, GapEvent, MonotonicClock, MqttEvent,
    MqttMessage, MqttPublisher, MqttPusher, NodeConfig, PeriodicScheduler, PushPath,
    ReadingCache, Sampler, SensorNode, TransportError,
};

const CENTRAL_CONNECT_AFTER: Duration = Duration::from_secs(25);
const CENTRAL_STAY_CONNECTED: Duration = Duration::from_secs(40);

/// Answers the AHT20 command protocol with slowly cycling values.
struct EmulatedAht20 {
    measurements: u32,
}

impl EmulatedAht20 {
    fn frame(&self) -> [u8; FRAME_LEN] {
        let temperature_centi = 2_050 + u64::from(self.measurements % 8) * 20;
        let humidity_centi = 4_200 + u64::from(self.measurements % 6) * 50;

        let raw_t = ((temperature_centi + 5_000) << 20).div_ceil(20_000) as u32;
        let raw_h = (humidity_centi << 20).div_ceil(10_000) as u32;

        [
            STATUS_CALIBRATED,
            (raw_h >> 12) as u8,
            (raw_h >> 4) as u8,
            (((raw_h & 0x0F) << 4) as u8) | ((raw_t >> 16) as u8 & 0x0F),
            (raw_t >> 8) as u8,
            raw_t as u8,
        ]
    }
}

impl ErrorType for EmulatedAht20 {
    type Error = ErrorKind;
}

impl I2c for EmulatedAht20 {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        if address != AHT20_ADDRESS {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        }
        for op in operations {
            match op {
                Operation::Write(bytes) => {
                    if bytes.first() == Some(&CMD_TRIGGER) {
                        self.measurements = self.measurements.wrapping_add(1);
                    }
                }
                Operation::Read(buffer) => {
                    let frame = self.frame();
                    let len = buffer.len().min(FRAME_LEN);
                    buffer[..len].copy_from_slice(&frame[..len]);
                }
            }
        }
        Ok(())
    }
}

struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        thread::sleep(Duration::from_nanos(u64::from(ns)));
    }

    fn delay_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}

/// No radio on the host: advertising and notifications are logged.
struct LogRadio;

impl BleTransport for LogRadio {
    type Error = std::convert::Infallible;

    fn start_advertising(&mut self, device_name: &str) -> Result<(), Self::Error> {
        info!("ble(sim): advertising as `{device_name}`");
        Ok(())
    }

    fn notify(
        &mut self,
        conn_handle: ConnHandle,
        characteristic: Characteristic,
        value: &[u8],
    ) -> Result<(), Self::Error> {
        info!(
            "ble(sim): notify conn={conn_handle} {} (0x{:04X}) = {value:02X?}",
            characteristic.as_str(),
            characteristic.uuid16()
        );
        Ok(())
    }

    fn set_indicator(&mut self, on: bool) {
        info!("ble(sim): led {}", if on { "on" } else { "off" });
    }
}

struct RumqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher for RumqttPublisher {
    fn publish(&mut self, message: &MqttMessage) -> Result<(), TransportError> {
        let qos = match message.delivery {
            Delivery::AtMostOnce => QoS::AtMostOnce,
            Delivery::AtLeastOnce => QoS::AtLeastOnce,
        };
        self.client
            .try_publish(message.topic, qos, message.retain, message.payload.clone())
            .map_err(|err| TransportError::Publish(err.to_string()))
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = NodeConfig::default();
    if config.push_path == PushPath::Http {
        warn!("host build has no TLS HTTP client; using the MQTT push path");
        config.push_path = PushPath::Mqtt;
    }

    let (mqtt_host, mqtt_port) = config
        .mqtt
        .broker_host_port()
        .ok_or_else(|| anyhow!("invalid broker uri `{}`", config.mqtt.broker_uri))?;
    let mqtt_options = MqttOptions::new(config.mqtt.client_id.clone(), mqtt_host, mqtt_port);
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 32);

    let sensor = Aht20::with_address(
        EmulatedAht20 { measurements: 0 },
        StdDelay,
        config.sensor.i2c_address,
    );
    let cache = ReadingCache::new();
    let sampler = Sampler::new(sensor, cache.clone(), config.sample_interval_ms);

    let ble = Arc::new(BlePeripheral::new(config.ble.device_name.clone(), LogRadio));
    ble.start();
    spawn_scripted_central(ble.clone())?;

    let node = SensorNode::new(sampler, ble);

    let pusher = MqttPusher::new(
        RumqttPublisher {
            client: mqtt.clone(),
        },
        cache,
    );
    spawn_mqtt_loop(pusher.clone(), eventloop);

    let clock = MonotonicClock::new();
    let mut scheduler = PeriodicScheduler::new();
    node.arm_sampling(&mut scheduler, config.sample_interval_ms, clock.now_ms());
    node.arm_push(&scheduler.handle(), config.push_interval_ms(), pusher)
        .context("failed to arm push timer")?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        thread::Builder::new()
            .name("timer-svc".to_string())
            .spawn(move || scheduler.run(&clock, || running.load(Ordering::Relaxed)))
            .context("failed to spawn timer service thread")?;
    }

    info!(
        "sensor node started (sample every {} ms, {} push every {} ms)",
        config.sample_interval_ms,
        config.push_path.as_str(),
        config.push_interval_ms()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    running.store(false, Ordering::Relaxed);
    info!("shutting down");
    Ok(())
}

/// Stands in for a phone that connects, stays a while, then leaves.
fn spawn_scripted_central(ble: Arc<BlePeripheral<LogRadio>>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("ble-host".to_string())
        .spawn(move || {
            let mut conn_handle: ConnHandle = 0;
            loop {
                thread::sleep(CENTRAL_CONNECT_AFTER);
                conn_handle = conn_handle.wrapping_add(1);
                ble.handle_event(GapEvent::Connect { conn_handle });
                thread::sleep(CENTRAL_STAY_CONNECTED);
                ble.handle_event(GapEvent::Disconnect {
                    conn_handle,
                    reason: 0x13,
                });
            }
        })
        .context("failed to spawn simulated central")?;
    Ok(())
}

/// `try_publish` only queues into the event loop, so events are handled
/// inline.
fn spawn_mqtt_loop(pusher: MqttPusher<RumqttPublisher>, mut eventloop: rumqttc::EventLoop) {
    let dispatch = move |event: MqttEvent| {
        pusher.handle_event(event);
    };

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => dispatch(MqttEvent::Connected),
                Ok(Event::Incoming(Incoming::PubAck(ack))) => {
                    dispatch(MqttEvent::Published(u32::from(ack.pkid)))
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => dispatch(MqttEvent::Disconnected),
                Ok(_) => {}
                Err(err) => {
                    warn!("sensor mqtt poll error: {err}");
                    dispatch(MqttEvent::Disconnected);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}
