//! Fan-out wiring: one timer samples and notifies BLE, another pushes the
//! cached reading to the network. Neither path waits on the other.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};

use crate::{
    ble::{BlePeripheral, BleTransport, NotifyOutcome},
    config::PushPath,
    error::SchedulerStopped,
    http::{HttpPusher, HttpTransport},
    mqtt::{MqttPublisher, MqttPusher},
    reading::Reading,
    sampler::{ReadingCache, ReadingSource, Sampler},
    scheduler::{PeriodicScheduler, PeriodicTask, SchedulerHandle, TaskId},
};

pub trait NetworkPusher {
    fn path(&self) -> PushPath;

    /// Returns how many values were accepted by the transport.
    fn push(&mut self, reading: &Reading) -> usize;
}

impl<T: HttpTransport> NetworkPusher for HttpPusher<T> {
    fn path(&self) -> PushPath {
        PushPath::Http
    }

    fn push(&mut self, reading: &Reading) -> usize {
        usize::from(HttpPusher::push(self, reading).accepted)
    }
}

impl<P: MqttPublisher> NetworkPusher for MqttPusher<P> {
    fn path(&self) -> PushPath {
        PushPath::Mqtt
    }

    fn push(&mut self, reading: &Reading) -> usize {
        MqttPusher::push(self, reading)
    }
}

pub struct SensorNode<S, T> {
    sampler: Arc<Mutex<Sampler<S>>>,
    ble: Arc<BlePeripheral<T>>,
    cache: ReadingCache,
}

impl<S, T> Clone for SensorNode<S, T> {
    fn clone(&self) -> Self {
        Self {
            sampler: self.sampler.clone(),
            ble: self.ble.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<S, T> SensorNode<S, T>
where
    S: ReadingSource,
    T: BleTransport,
{
    pub fn new(sampler: Sampler<S>, ble: Arc<BlePeripheral<T>>) -> Self {
        let cache = sampler.cache().clone();
        Self {
            sampler: Arc::new(Mutex::new(sampler)),
            ble,
            cache,
        }
    }

    pub fn cache(&self) -> &ReadingCache {
        &self.cache
    }

    pub fn ble(&self) -> &Arc<BlePeripheral<T>> {
        &self.ble
    }

    /// Sampling-timer body. A failed sample skips this cycle's notification.
    pub fn sample_and_notify(&self, now_ms: u64) -> Option<Reading> {
        self.ble.ensure_advertising();

        let reading = self.sampler().refresh(now_ms)?;
        match self.ble.notify_if_connected(&reading) {
            NotifyOutcome::NotConnected => debug!("no BLE central; notification skipped"),
            NotifyOutcome::Sent { delivered, failed } => {
                debug!("BLE notifications delivered={delivered} failed={failed}")
            }
        }
        Some(reading)
    }

    /// Push-timer body. Reuses the cached reading while it is fresh.
    pub fn push<N: NetworkPusher>(&self, pusher: &mut N, now_ms: u64) -> usize {
        let Some(reading) = self.sampler().current(now_ms) else {
            info!("{} push skipped: no reading available", pusher.path().as_str());
            return 0;
        };
        pusher.push(&reading)
    }

    fn sampler(&self) -> MutexGuard<'_, Sampler<S>> {
        self.sampler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S, T> SensorNode<S, T>
where
    S: ReadingSource + Send + 'static,
    T: BleTransport + Send + 'static,
{
    pub fn arm_sampling(
        &self,
        scheduler: &mut PeriodicScheduler,
        interval_ms: u64,
        now_ms: u64,
    ) -> TaskId {
        let node = self.clone();
        scheduler.schedule(
            PeriodicTask::every("sample-notify", interval_ms),
            now_ms,
            move |now_ms| {
                node.sample_and_notify(now_ms);
            },
        )
    }

    pub fn arm_push<N>(
        &self,
        handle: &SchedulerHandle,
        interval_ms: u64,
        mut pusher: N,
    ) -> Result<(), SchedulerStopped>
    where
        N: NetworkPusher + Send + 'static,
    {
        let node = self.clone();
        let name = match pusher.path() {
            PushPath::Http => "http-push",
            PushPath::Mqtt => "mqtt-push",
        };
        handle.schedule(PeriodicTask::every(name, interval_ms), move |now_ms| {
            node.push(&mut pusher, now_ms);
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        aht20::{
            tests::{frame_for, RecordingDelay, ScriptedBus},
            Aht20,
        },
        ble::{Characteristic, ConnHandle, GapEvent, PeripheralState},
        config::CloudConfig,
        error::TransportError,
        http::PutRequest,
        mqtt::{MqttEvent, MqttMessage},
    };

    #[derive(Default)]
    struct Radio {
        notified: Vec<(Characteristic, Vec<u8>)>,
    }

    impl BleTransport for Radio {
        type Error = ();

        fn start_advertising(&mut self, _device_name: &str) -> Result<(), ()> {
            Ok(())
        }

        fn notify(
            &mut self,
            _conn_handle: ConnHandle,
            characteristic: Characteristic,
            value: &[u8],
        ) -> Result<(), ()> {
            self.notified.push((characteristic, value.to_vec()));
            Ok(())
        }

        fn set_indicator(&mut self, _on: bool) {}
    }

    /// Counts sensor read-backs through a shared counter.
    struct CountingSource {
        inner: Aht20<ScriptedBus, RecordingDelay>,
        reads: Arc<AtomicUsize>,
    }

    impl ReadingSource for CountingSource {
        fn sample(&mut self) -> Result<Reading, crate::error::SensorIoError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.sample()
        }
    }

    #[derive(Clone, Default)]
    struct SharedHttp {
        requests: Arc<Mutex<Vec<PutRequest>>>,
    }

    impl HttpTransport for SharedHttp {
        fn put(&mut self, request: &PutRequest) -> Result<u16, TransportError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(200)
        }
    }

    #[derive(Default)]
    struct Publisher {
        messages: Vec<MqttMessage>,
    }

    impl MqttPublisher for Publisher {
        fn publish(&mut self, message: &MqttMessage) -> Result<(), TransportError> {
            self.messages.push(message.clone());
            Ok(())
        }
    }

    fn node(frame: [u8; 6]) -> (SensorNode<CountingSource, Radio>, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            inner: Aht20::new(ScriptedBus::answering(frame), RecordingDelay::default()),
            reads: reads.clone(),
        };
        let ble = Arc::new(BlePeripheral::new("AHT20 Destiny", Radio::default()));
        ble.start();
        let sampler = Sampler::new(source, ReadingCache::new(), 10_000);
        (SensorNode::new(sampler, ble), reads)
    }

    #[test]
    fn sample_without_central_only_updates_cache() {
        let (node, _) = node(frame_for(0x80000, 0x80000));

        assert_eq!(node.sample_and_notify(10_000), Some(Reading::new(5_000, 5_000)));
        assert_eq!(
            node.cache().latest().map(|c| c.reading),
            Some(Reading::new(5_000, 5_000))
        );
        assert!(node.ble().with_transport(|radio| radio.notified.is_empty()));
    }

    #[test]
    fn sample_with_central_notifies_both_characteristics() {
        let (node, _) = node(frame_for(0x80000, 0x40000));
        node.ble().handle_event(GapEvent::Connect { conn_handle: 1 });

        node.sample_and_notify(10_000);

        let notified = node.ble().with_transport(|radio| radio.notified.clone());
        assert_eq!(
            notified,
            vec![
                (Characteristic::Temperature, vec![0x00, 0x00]),
                (Characteristic::Humidity, 5_000_u16.to_le_bytes().to_vec()),
            ]
        );
    }

    #[test]
    fn failed_sample_skips_notification() {
        let reads = Arc::new(AtomicUsize::new(0));
        let mut bus = ScriptedBus::answering(frame_for(1, 1));
        bus.fail_read = true;
        let source = CountingSource {
            inner: Aht20::new(bus, RecordingDelay::default()),
            reads,
        };
        let ble = Arc::new(BlePeripheral::new("AHT20 Destiny", Radio::default()));
        ble.start();
        ble.handle_event(GapEvent::Connect { conn_handle: 2 });
        let node = SensorNode::new(Sampler::new(source, ReadingCache::new(), 10_000), ble);

        assert_eq!(node.sample_and_notify(10_000), None);
        assert!(node.ble().with_transport(|radio| radio.notified.is_empty()));
        assert_eq!(node.ble().state(), PeripheralState::Connected);
    }

    #[test]
    fn push_reuses_fresh_sample() {
        let (node, reads) = node(frame_for(0x80000, 0x80000));
        let mut pusher = HttpPusher::new(CloudConfig::default(), SharedHttp::default());

        node.sample_and_notify(10_000);
        assert_eq!(node.push(&mut pusher, 10_001), 2);
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        // Stale cache triggers exactly one extra read.
        assert_eq!(node.push(&mut pusher, 25_000), 2);
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn mqtt_push_goes_through_shared_pusher() {
        let (node, _) = node(frame_for(0x80000, 0x80000));
        let mqtt = MqttPusher::new(Publisher::default(), node.cache().clone());
        let mut shared = mqtt.clone();

        node.sample_and_notify(0);
        assert_eq!(node.push(&mut shared, 1), 0);

        mqtt.handle_event(MqttEvent::Connected);
        assert_eq!(node.push(&mut shared, 2), 2);

        let payloads: Vec<_> = mqtt.with_publisher(|publisher| {
            publisher
                .messages
                .iter()
                .map(|m| (m.topic, m.payload.clone()))
                .collect()
        });
        assert_eq!(
            payloads,
            vec![
                ("/destiny/sensor/temperature", "50.00".to_string()),
                ("/destiny/sensor/humidity", "50.00".to_string()),
                ("/destiny/sensor/temperature", "50.00".to_string()),
                ("/destiny/sensor/humidity", "50.00".to_string()),
            ]
        );
    }

    #[test]
    fn timers_drive_independent_cadences() {
        let (node, reads) = node(frame_for(0x80000, 0x80000));
        node.ble().handle_event(GapEvent::Connect { conn_handle: 5 });
        let http = SharedHttp::default();
        let requests = http.requests.clone();

        let mut scheduler = PeriodicScheduler::new();
        node.arm_sampling(&mut scheduler, 10_000, 0);
        node.arm_push(
            &scheduler.handle(),
            30_000,
            HttpPusher::new(CloudConfig::default(), http),
        )
        .expect("scheduler alive");

        for now in (0..=60_000).step_by(10_000) {
            scheduler.run_due(now);
        }

        // Six sampling ticks; push ticks at 30 s and 60 s reuse those samples.
        assert_eq!(reads.load(Ordering::SeqCst), 6);
        assert_eq!(
            node.ble().with_transport(|radio| radio.notified.len()),
            12
        );
        assert_eq!(requests.lock().unwrap().len(), 4);
    }
}
