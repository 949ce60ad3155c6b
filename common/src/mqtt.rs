use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::Receiver,
    Arc, Mutex, PoisonError,
};

use log::{debug, info, warn};

use crate::{
    error::TransportError,
    reading::Reading,
    sampler::ReadingCache,
    topics::{TOPIC_SENSOR_HUMIDITY, TOPIC_SENSOR_TEMP},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    AtMostOnce,
    AtLeastOnce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: &'static str,
    pub payload: String,
    pub delivery: Delivery,
    pub retain: bool,
}

impl MqttMessage {
    pub fn for_reading(reading: &Reading) -> [Self; 2] {
        [
            Self::reading_value(TOPIC_SENSOR_TEMP, reading.temperature_decimal()),
            Self::reading_value(TOPIC_SENSOR_HUMIDITY, reading.humidity_decimal()),
        ]
    }

    fn reading_value(topic: &'static str, payload: String) -> Self {
        Self {
            topic,
            payload,
            delivery: Delivery::AtLeastOnce,
            retain: false,
        }
    }
}

pub trait MqttPublisher {
    fn publish(&mut self, message: &MqttMessage) -> Result<(), TransportError>;
}

/// Client events the pusher reacts to. Reconnection itself belongs to the
/// client library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    Connected,
    Disconnected,
    Published(u32),
    Error(String),
    Other(String),
}

/// Shared by the client's event context and the push timer. The connection
/// flag and the publisher have separate locks, so handling a client event
/// never waits on a publish in flight.
pub struct MqttPusher<P> {
    publisher: Arc<Mutex<P>>,
    cache: ReadingCache,
    connected: Arc<AtomicBool>,
}

impl<P> Clone for MqttPusher<P> {
    fn clone(&self) -> Self {
        Self {
            publisher: self.publisher.clone(),
            cache: self.cache.clone(),
            connected: self.connected.clone(),
        }
    }
}

impl<P: MqttPublisher> MqttPusher<P> {
    pub fn new(publisher: P, cache: ReadingCache) -> Self {
        Self {
            publisher: Arc::new(Mutex::new(publisher)),
            cache,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn with_publisher<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut self.publisher.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Returns how many messages were handed to the client.
    pub fn handle_event(&self, event: MqttEvent) -> usize {
        match event {
            MqttEvent::Connected => {
                info!("MQTT connected");
                self.connected.store(true, Ordering::SeqCst);
                match self.cache.latest() {
                    Some(cached) => self.publish_reading(&cached.reading),
                    None => {
                        info!("MQTT connected before first sample; nothing to publish");
                        0
                    }
                }
            }
            MqttEvent::Disconnected => {
                info!("MQTT disconnected");
                self.connected.store(false, Ordering::SeqCst);
                0
            }
            MqttEvent::Published(msg_id) => {
                debug!("MQTT published, msg_id={msg_id}");
                0
            }
            MqttEvent::Error(message) => {
                warn!("MQTT error: {message}");
                0
            }
            MqttEvent::Other(description) => {
                debug!("MQTT event: {description}");
                0
            }
        }
    }

    /// Handles events forwarded by the client's poll loop until every sender
    /// is gone. The poll loop only receives and forwards, so it is already
    /// waiting for the next event whenever a publish runs here.
    pub fn dispatch_events(&self, events: Receiver<MqttEvent>) -> usize {
        let mut handled = 0;
        for event in events {
            self.handle_event(event);
            handled += 1;
        }
        debug!("MQTT event channel closed after {handled} event(s)");
        handled
    }

    /// Periodic push. Skipped while the client is between connections.
    pub fn push(&self, reading: &Reading) -> usize {
        if !self.is_connected() {
            debug!("MQTT not connected; skipping push");
            return 0;
        }
        self.publish_reading(reading)
    }

    fn publish_reading(&self, reading: &Reading) -> usize {
        let mut sent = 0;
        for message in MqttMessage::for_reading(reading) {
            let result = self.with_publisher(|publisher| publisher.publish(&message));
            match result {
                Ok(()) => {
                    info!("MQTT publish {} = {}", message.topic, message.payload);
                    sent += 1;
                }
                Err(err) => warn!("MQTT publish to {} failed: {err}", message.topic),
            }
        }
        sent
    }
}
