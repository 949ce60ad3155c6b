use std::{
    sync::{mpsc, Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::Write,
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp32_nimble::{
    utilities::{mutex::Mutex as NimbleMutex, BleUuid},
    BLEAdvertisementData, BLEAdvertising, BLECharacteristic, BLEDevice, NimbleProperties,
};
use esp_idf_hal::{
    delay::FreeRtos,
    gpio::{Gpio1, Output, PinDriver},
    i2c::{I2cConfig, I2cDriver},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::{EspSubscription, EspSystemEventLoop, System},
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration},
    netif::IpEvent,
    nvs::EspDefaultNvsPartition,
    wifi::{EspWifi, WifiEvent},
};
use log::{info, warn};

use destiny_common::{
    ble::{ConnHandle, ESS_SERVICE_UUID},
    config::{MqttConfig, NetworkConfig},
    mqtt::Delivery,
    Aht20, BlePeripheral, BleTransport, Characteristic, ConnectivityError, GapEvent, HttpPusher,
    HttpTransport, LinkAction, LinkEvent, MonotonicClock, MqttEvent, MqttMessage, MqttPublisher,
    MqttPusher, NodeConfig, PeriodicScheduler, PeriodicTask, PushPath, PutRequest, ReadingCache,
    ReconnectPolicy, Sampler, SchedulerHandle, SensorNode, TransportError,
};

const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const TIMER_STACK_SIZE: usize = 16 * 1024;

type Sensor = Aht20<I2cDriver<'static>, FreeRtos>;
type Node = SensorNode<Sensor, EspBleTransport>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let config = NodeConfig::default();
    info!(
        "starting `{}` ({} push every {} ms)",
        config.ble.device_name,
        config.push_path.as_str(),
        config.push_interval_ms()
    );

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals {
        modem, pins, i2c0, ..
    } = Peripherals::take()?;

    let i2c = I2cDriver::new(
        i2c0,
        pins.gpio4,
        pins.gpio5,
        &I2cConfig::new().baudrate(Hertz(config.sensor.clock_hz)),
    )
    .context("failed to initialize i2c master")?;
    let cache = ReadingCache::new();
    let sampler = Sampler::new(
        Aht20::with_address(i2c, FreeRtos, config.sensor.i2c_address),
        cache.clone(),
        config.sample_interval_ms,
    );

    let led = PinDriver::output(pins.gpio1).context("failed to configure led pin")?;
    let ble = start_ble(&config.ble.device_name, &cache, led).context("ble startup failed")?;
    let node = SensorNode::new(sampler, ble);

    let clock = MonotonicClock::new();
    let mut scheduler = PeriodicScheduler::new();
    node.arm_sampling(&mut scheduler, config.sample_interval_ms, clock.now_ms());

    let push = PushSetup {
        node: node.clone(),
        handle: scheduler.handle(),
        config: config.clone(),
    };
    let wifi = start_wifi(modem, sys_loop, nvs_partition, &config.network, push)
        .context("wifi startup failed")?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    thread::Builder::new()
        .name("timer-svc".to_string())
        .stack_size(TIMER_STACK_SIZE)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("timer service is not watched: {err:#}");
            }
            scheduler.run(&clock, || {
                feed_watchdog();
                true
            });
        })
        .context("failed to spawn timer service thread")?;

    // Keep the radio drivers alive for the program lifetime.
    let _wifi = wifi;
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

struct EspBleTransport {
    advertising: &'static NimbleMutex<BLEAdvertising>,
    temperature: Arc<NimbleMutex<BLECharacteristic>>,
    humidity: Arc<NimbleMutex<BLECharacteristic>>,
    led: PinDriver<'static, Gpio1, Output>,
}

impl BleTransport for EspBleTransport {
    type Error = esp32_nimble::BLEError;

    fn start_advertising(&mut self, device_name: &str) -> Result<(), Self::Error> {
        let mut data = BLEAdvertisementData::new();
        data.name(device_name)
            .add_service_uuid(BleUuid::from_uuid16(ESS_SERVICE_UUID));

        let mut advertising = self.advertising.lock();
        advertising.set_data(&mut data)?;
        advertising.start()
    }

    fn notify(
        &mut self,
        conn_handle: ConnHandle,
        characteristic: Characteristic,
        value: &[u8],
    ) -> Result<(), Self::Error> {
        let target = match characteristic {
            Characteristic::Temperature => &self.temperature,
            Characteristic::Humidity => &self.humidity,
        };
        target.lock().notify_with(value, conn_handle)
    }

    fn set_indicator(&mut self, on: bool) {
        let result = if on {
            self.led.set_high()
        } else {
            self.led.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive connection led: {err:?}");
        }
    }
}

fn start_ble(
    device_name: &str,
    cache: &ReadingCache,
    led: PinDriver<'static, Gpio1, Output>,
) -> anyhow::Result<Arc<BlePeripheral<EspBleTransport>>> {
    let ble_device = BLEDevice::take();
    BLEDevice::set_device_name(device_name)
        .map_err(|err| anyhow!("failed to set gap device name: {err:?}"))?;

    let advertising = ble_device.get_advertising();
    let server = ble_device.get_server();
    // Re-advertising after a disconnect is driven by the peripheral state.
    server.advertise_on_disconnect(false);

    let service = server.create_service(BleUuid::from_uuid16(ESS_SERVICE_UUID));
    let [temperature, humidity] = Characteristic::ALL.map(|characteristic| {
        let handle = service.lock().create_characteristic(
            BleUuid::from_uuid16(characteristic.uuid16()),
            NimbleProperties::READ | NimbleProperties::NOTIFY,
        );
        let cache = cache.clone();
        handle.lock().on_read(move |value, _desc| {
            value.set_value(&characteristic.value(&cache.reading_or_default()));
        });
        handle
    });

    let ble = Arc::new(BlePeripheral::new(
        device_name,
        EspBleTransport {
            advertising,
            temperature,
            humidity,
            led,
        },
    ));

    {
        let ble = ble.clone();
        server.on_connect(move |_server, desc| {
            ble.handle_event(GapEvent::Connect {
                conn_handle: desc.conn_handle(),
            });
        });
    }
    {
        let ble = ble.clone();
        server.on_disconnect(move |desc, reason| {
            let reason = reason.err().map_or(0, |err| err.code() as i32);
            ble.handle_event(GapEvent::Disconnect {
                conn_handle: desc.conn_handle(),
                reason,
            });
        });
    }

    ble.start();
    Ok(ble)
}

struct WifiLink {
    _wifi: EspWifi<'static>,
    _wifi_events: EspSubscription<'static, System>,
    _ip_events: EspSubscription<'static, System>,
}

/// Station bring-up. Association attempts are driven from station events:
/// the first on start, one retry per reported disconnect, bounded by the
/// reconnect policy.
fn start_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
    push: PushSetup,
) -> anyhow::Result<WifiLink> {
    let mut wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    let policy = Arc::new(Mutex::new(ReconnectPolicy::new(network.max_retries)));

    let wifi_events = {
        let policy = policy.clone();
        sys_loop.subscribe::<WifiEvent, _>(move |event| {
            let link_event = match event {
                WifiEvent::StaStarted => LinkEvent::Started,
                WifiEvent::StaDisconnected(_) => LinkEvent::Disconnected,
                _ => return,
            };
            let action = policy
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .handle_event(link_event);
            match action {
                LinkAction::Connect | LinkAction::Reconnect { .. } => request_association(),
                LinkAction::GiveUp(err) => warn!("{err}; continuing BLE-only"),
                LinkAction::LinkUp { .. } | LinkAction::Steady | LinkAction::Offline => {}
            }
        })?
    };

    let ip_events = sys_loop.subscribe::<IpEvent, _>(move |event| {
        if !matches!(event, IpEvent::DhcpIpAssigned(_)) {
            return;
        }
        let action = policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle_event(LinkEvent::GotIp);
        if action == (LinkAction::LinkUp { first: true }) {
            push.arm();
        }
    })?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    Ok(WifiLink {
        _wifi: wifi,
        _wifi_events: wifi_events,
        _ip_events: ip_events,
    })
}

fn request_association() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_connect() };
    if rc != esp_idf_svc::sys::ESP_OK {
        let err = ConnectivityError::Associate(format!("esp_wifi_connect returned {rc}"));
        warn!("{err}");
    }
}

/// Everything needed to start the network push once the node has an address.
#[derive(Clone)]
struct PushSetup {
    node: Node,
    handle: SchedulerHandle,
    config: NodeConfig,
}

impl PushSetup {
    /// Client construction runs on the timer service, not in the event loop
    /// task that reported the address.
    fn arm(&self) {
        let setup = self.clone();
        let scheduled = self
            .handle
            .schedule(PeriodicTask::once("push-setup", 0), move |_| {
                if let Err(err) = setup.start() {
                    warn!(
                        "failed to start {} push: {err:#}",
                        setup.config.push_path.as_str()
                    );
                }
            });
        if let Err(err) = scheduled {
            warn!("network push not armed: {err}");
        }
    }

    fn start(&self) -> anyhow::Result<()> {
        let interval_ms = self.config.push_interval_ms();
        match self.config.push_path {
            PushPath::Http => {
                let pusher = HttpPusher::new(self.config.cloud.clone(), EspHttpTransport);
                self.node.arm_push(&self.handle, interval_ms, pusher)?;
            }
            PushPath::Mqtt => {
                let pusher = start_mqtt(&self.config.mqtt, self.node.cache().clone())?;
                self.node.arm_push(&self.handle, interval_ms, pusher)?;
            }
        }
        info!(
            "{} push armed every {interval_ms} ms",
            self.config.push_path.as_str()
        );
        Ok(())
    }
}

/// One TLS connection per request, released once the status is read.
struct EspHttpTransport;

impl HttpTransport for EspHttpTransport {
    fn put(&mut self, request: &PutRequest) -> Result<u16, TransportError> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(HTTP_TIMEOUT),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&http_conf)
            .map_err(|err| TransportError::Open(format!("{err:?}")))?;
        let mut client = HttpClient::wrap(connection);

        let content_length = request.body.len().to_string();
        let mut headers: Vec<(&str, &str)> = request
            .headers
            .iter()
            .map(|(name, value)| (*name, value.as_str()))
            .collect();
        headers.push(("Content-Length", content_length.as_str()));

        let mut outgoing = client
            .request(Method::Put, &request.url, &headers)
            .map_err(|err| TransportError::Open(format!("{err:?}")))?;
        outgoing
            .write_all(&request.body)
            .map_err(|err| TransportError::Perform(format!("{err:?}")))?;
        let response = outgoing
            .submit()
            .map_err(|err| TransportError::Perform(format!("{err:?}")))?;
        Ok(response.status())
    }
}

struct EspMqttPublisher {
    client: EspMqttClient<'static>,
}

impl MqttPublisher for EspMqttPublisher {
    fn publish(&mut self, message: &MqttMessage) -> Result<(), TransportError> {
        let qos = match message.delivery {
            Delivery::AtMostOnce => QoS::AtMostOnce,
            Delivery::AtLeastOnce => QoS::AtLeastOnce,
        };
        self.client
            .publish(message.topic, qos, message.retain, message.payload.as_bytes())
            .map(|_| ())
            .map_err(|err| TransportError::Publish(format!("{err:?}")))
    }
}

/// The poll thread only receives and forwards, so the client task is never
/// parked on an undelivered event while something publishes.
fn start_mqtt(
    mqtt: &MqttConfig,
    cache: ReadingCache,
) -> anyhow::Result<MqttPusher<EspMqttPublisher>> {
    let conf = MqttClientConfiguration {
        client_id: Some(mqtt.client_id.as_str()),
        ..Default::default()
    };
    let (client, mut conn) = EspMqttClient::new(&mqtt.broker_uri, &conf)?;
    let pusher = MqttPusher::new(EspMqttPublisher { client }, cache);
    let (events_tx, events_rx) = mpsc::channel();

    thread::Builder::new()
        .name("mqtt-poll".to_string())
        .stack_size(8192)
        .spawn(move || loop {
            let event = match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => MqttEvent::Connected,
                    EventPayload::Disconnected => MqttEvent::Disconnected,
                    EventPayload::Published(id) => MqttEvent::Published(id),
                    EventPayload::Error(err) => MqttEvent::Error(format!("{err:?}")),
                    other => MqttEvent::Other(format!("{other:?}")),
                },
                Err(err) => {
                    warn!("sensor mqtt poll error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    continue;
                }
            };
            if events_tx.send(event).is_err() {
                break;
            }
        })
        .context("failed to spawn mqtt poll thread")?;

    {
        let pusher = pusher.clone();
        thread::Builder::new()
            .name("mqtt-events".to_string())
            .stack_size(8192)
            .spawn(move || {
                pusher.dispatch_events(events_rx);
            })
            .context("failed to spawn mqtt event thread")?;
    }

    Ok(pusher)
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}
