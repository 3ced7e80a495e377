use std::time::Duration;

use blueshift::backend::CharacteristicPath;
use blueshift::btuuid::{characteristics, descriptors, services};
use blueshift::emulation::{
    AuthorizationBehavior, EmulatedCentral, EmulatedCentralConfig, EmulatedCharacteristic, EmulatedDescriptor,
    EmulatedManagerConfig, EmulatedPeripheral, EmulatedService, RadioCall,
};
use blueshift::error::ErrorKind;
use blueshift::{
    AdvertisementData, BluetoothId, CentralManager, CharacteristicProperties, Manager, ManagerState, Peripheral,
    PeripheralState,
};
use futures_lite::future::poll_once;
use futures_lite::StreamExt;
use tracing_subscriber::EnvFilter;

const MONITOR: BluetoothId = BluetoothId::from_u128(0xe25d7781_ebdd_440d_b2df_82321cf060c7);
const SCALE: BluetoothId = BluetoothId::from_u128(0xef89e4b6_ee7d_404b_8e35_ea99f93b7077);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn granted() -> EmulatedManagerConfig {
    EmulatedManagerConfig {
        authorization_behavior: AuthorizationBehavior::Success,
        ..Default::default()
    }
}

fn readable() -> CharacteristicProperties {
    CharacteristicProperties {
        read: true,
        ..Default::default()
    }
}

fn heart_rate_service() -> EmulatedService {
    EmulatedService::new(services::HEART_RATE)
        .with_characteristic(
            EmulatedCharacteristic::new(
                characteristics::HEART_RATE_MEASUREMENT,
                CharacteristicProperties {
                    notify: true,
                    ..Default::default()
                },
            )
            .with_descriptor(EmulatedDescriptor::new(descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION).with_value([0u8, 0])),
        )
        .with_characteristic(EmulatedCharacteristic::new(characteristics::BODY_SENSOR_LOCATION, readable()).with_value([1u8]))
}

fn battery_service() -> EmulatedService {
    EmulatedService::new(services::BATTERY)
        .with_characteristic(EmulatedCharacteristic::new(characteristics::BATTERY_LEVEL, readable()).with_value([87u8]))
}

fn heart_monitor() -> EmulatedPeripheral {
    EmulatedPeripheral::new(MONITOR)
        .with_name("Heart Monitor")
        .with_advertisement(AdvertisementData {
            services: vec![services::HEART_RATE],
            ..Default::default()
        })
        .with_rssi(-48)
        .with_service(heart_rate_service())
        .with_service(battery_service())
}

fn scale() -> EmulatedPeripheral {
    EmulatedPeripheral::new(SCALE)
        .with_name("Scale")
        .with_service(battery_service())
}

fn measurement_path() -> CharacteristicPath {
    CharacteristicPath {
        peripheral: MONITOR,
        service: services::HEART_RATE,
        characteristic: characteristics::HEART_RATE_MEASUREMENT,
    }
}

async fn start(config: EmulatedCentralConfig, peripherals: Vec<EmulatedPeripheral>) -> (CentralManager, EmulatedCentral) {
    init_tracing();
    let radio = EmulatedCentral::new(config, peripherals);
    let manager = CentralManager::new(radio.clone());
    manager.request_authorization();
    manager.ensure_ready(false).await.unwrap();
    (manager, radio)
}

async fn powered_on(peripherals: Vec<EmulatedPeripheral>) -> (CentralManager, EmulatedCentral) {
    start(EmulatedCentralConfig::immediate(granted()), peripherals).await
}

async fn connected(manager: &CentralManager, id: BluetoothId) -> Peripheral {
    let peripheral = manager.peripheral(&id).unwrap();
    peripheral.connect().await.unwrap();
    peripheral
}

#[tokio::test]
async fn scan_reports_matching_peripherals() {
    let (manager, radio) = powered_on(vec![heart_monitor(), scale()]).await;

    let found: Vec<Peripheral> = manager.scan(&[services::HEART_RATE]).map(|x| x.unwrap()).collect().await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), MONITOR);
    assert_eq!(found[0].name(), "Heart Monitor");
    assert_eq!(found[0].rssi(), Some(-48));
    assert!(!manager.is_scanning());
    assert_eq!(
        radio.calls(),
        vec![RadioCall::Initialize, RadioCall::Scan(vec![services::HEART_RATE])]
    );
}

#[tokio::test]
async fn rediscovery_updates_peripheral_in_place() {
    let config = EmulatedCentralConfig {
        manager: granted(),
        scan_emit_rate: 0.2,
    };
    let (manager, radio) = start(config, vec![heart_monitor()]).await;

    let mut scan = manager.scan(&[]);
    let found = scan.next().await.unwrap().unwrap();
    assert_eq!(found.advertisement().local_name, None);

    radio.advertise(
        heart_monitor()
            .with_advertisement(AdvertisementData {
                local_name: Some("HRM".to_owned()),
                ..Default::default()
            })
            .with_rssi(-70),
    );
    assert!(scan.next().await.is_none());

    assert_eq!(manager.peripherals(), vec![found.clone()]);
    let advertisement = found.advertisement();
    assert_eq!(advertisement.local_name.as_deref(), Some("HRM"));
    assert_eq!(advertisement.services, vec![services::HEART_RATE]);
    assert_eq!(found.rssi(), Some(-70));
}

#[tokio::test]
async fn new_scan_forgets_previous_peripherals() {
    let (manager, radio) = powered_on(vec![heart_monitor()]).await;

    let first = manager.scan(&[]).next().await.unwrap().unwrap();
    first.connect().await.unwrap();
    assert!(radio.is_connected(&MONITOR));

    let second = manager.scan(&[]).next().await.unwrap().unwrap();
    assert_ne!(first, second);
    assert_eq!(second.id(), MONITOR);
    assert_eq!(manager.peripherals(), vec![second.clone()]);

    // the forgotten handle keeps its link
    assert_eq!(first.state(), PeripheralState::Connected);
    assert!(radio.is_connected(&MONITOR));
    assert!(!radio.calls().contains(&RadioCall::CancelConnection(MONITOR)));
    let discovered = first.discover_services(&[]).await.unwrap();
    assert_eq!(discovered.len(), 2);
    assert_eq!(second.state(), PeripheralState::Disconnected);

    first.disconnect();
    assert!(!radio.is_connected(&MONITOR));
    assert_eq!(first.state(), PeripheralState::Disconnected);
    let err = first.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}

#[tokio::test]
async fn overlapping_scan_ends_previous_stream() {
    let config = EmulatedCentralConfig {
        manager: granted(),
        scan_emit_rate: 0.2,
    };
    let (manager, _radio) = start(config, vec![heart_monitor(), scale()]).await;

    let mut first = manager.scan(&[]);
    assert_eq!(first.next().await.unwrap().unwrap().id(), MONITOR);
    assert_eq!(manager.peripherals().len(), 1);

    let mut second = manager.scan(&[]);
    assert_eq!(manager.peripherals().len(), 1);
    assert!(poll_once(second.next()).await.is_none());
    assert!(manager.peripherals().is_empty());
    assert!(manager.is_scanning());
    assert!(first.next().await.is_none());
    drop(first);
    assert!(manager.is_scanning());

    let found: Vec<Peripheral> = second.map(|x| x.unwrap()).collect().await;
    let ids: Vec<BluetoothId> = found.iter().map(|x| x.id()).collect();
    assert_eq!(ids, vec![MONITOR, SCALE]);
}

#[tokio::test]
async fn scan_waits_for_power() {
    init_tracing();
    let radio = EmulatedCentral::new(EmulatedCentralConfig::immediate(granted()), vec![heart_monitor()]);
    let manager = CentralManager::new(radio.clone());

    let scan = tokio::spawn({
        let manager = manager.clone();
        async move { manager.scan(&[]).next().await.map(|x| x.map(|p| p.id())) }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(radio.calls().is_empty());

    manager.request_authorization();
    let found = scan.await.unwrap().unwrap().unwrap();
    assert_eq!(found, MONITOR);
}

#[tokio::test]
async fn scan_fails_without_authorization() {
    init_tracing();
    let radio = EmulatedCentral::new(
        EmulatedCentralConfig::immediate(EmulatedManagerConfig::default()),
        vec![heart_monitor()],
    );
    let manager = CentralManager::new(radio.clone());
    manager.request_authorization();
    assert_eq!(manager.state(), ManagerState::Unauthorized);

    let err = manager.scan(&[]).next().await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotPoweredOn);
    assert_eq!(radio.calls(), vec![RadioCall::Initialize]);

    let peripheral = manager.peripheral(&MONITOR).unwrap();
    assert_eq!(peripheral.connect().await.unwrap_err().kind(), ErrorKind::NotPoweredOn);
}

#[tokio::test]
async fn power_loss_fails_active_scan() {
    let config = EmulatedCentralConfig {
        manager: granted(),
        scan_emit_rate: 5.0,
    };
    let (manager, radio) = start(config, vec![heart_monitor()]).await;

    let mut scan = manager.scan(&[]);
    assert!(poll_once(scan.next()).await.is_none());
    assert!(manager.is_scanning());

    radio.set_state(ManagerState::PoweredOff);
    let err = scan.next().await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    assert!(scan.next().await.is_none());
    assert!(!manager.is_scanning());
}

#[tokio::test]
async fn read_requires_readable_characteristic() {
    let (manager, radio) = powered_on(vec![heart_monitor()]).await;
    let peripheral = connected(&manager, MONITOR).await;

    let discovered = peripheral.discover_services(&[services::HEART_RATE]).await.unwrap();
    assert_eq!(discovered.len(), 1);
    let service = &discovered[0];
    assert_eq!(service.name(), "Heart Rate");

    let found = service.discover_characteristics(&[]).await.unwrap();
    assert_eq!(found.len(), 2);
    let measurement = service.characteristic(&characteristics::HEART_RATE_MEASUREMENT).unwrap();

    radio.clear_calls();
    let err = measurement.read().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CharacteristicReadNotAvailable);
    assert!(radio.calls().is_empty());

    let location = service.characteristic(&characteristics::BODY_SENSOR_LOCATION).unwrap();
    assert_eq!(location.name(), "Body Sensor Location");
    assert_eq!(location.read().await.unwrap(), vec![1]);
    assert_eq!(location.value(), Some(vec![1]));

    let err = location.subscribe_to_changes().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
}

#[tokio::test]
async fn disconnect_fails_in_flight_operations() {
    let (manager, radio) = powered_on(vec![heart_monitor()]).await;
    let peripheral = connected(&manager, MONITOR).await;
    assert_eq!(peripheral.discover_services(&[]).await.unwrap().len(), 2);
    let battery = peripheral.service(&services::BATTERY).unwrap();
    let level = battery.discover_characteristics(&[]).await.unwrap().pop().unwrap();

    radio.set_responding(false);
    let mut read = Box::pin(level.read());
    assert!(poll_once(&mut read).await.is_none());

    assert!(radio.disconnect_peripheral(&MONITOR, None));
    assert_eq!(read.await.unwrap_err().kind(), ErrorKind::NotConnected);
    assert_eq!(peripheral.state(), PeripheralState::Disconnected);
    assert!(peripheral.services().is_empty());
    assert!(battery.is_invalidated());
    assert!(level.is_invalidated());

    let err = level.read().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CharacteristicInvalidated(characteristics::BATTERY_LEVEL));

    // the held answer arrives after the link is gone and is dropped
    assert_eq!(radio.release_held(), 1);
}

#[tokio::test]
async fn newer_read_supersedes_older() {
    let (manager, radio) = powered_on(vec![heart_monitor()]).await;
    let peripheral = connected(&manager, MONITOR).await;
    peripheral.discover_services(&[services::BATTERY]).await.unwrap();
    let battery = peripheral.service(&services::BATTERY).unwrap();
    let level = battery.discover_characteristics(&[characteristics::BATTERY_LEVEL]).await.unwrap().pop().unwrap();

    radio.set_responding(false);
    let mut first = Box::pin(level.read());
    assert!(poll_once(&mut first).await.is_none());
    let mut second = Box::pin(level.read());
    assert!(poll_once(&mut second).await.is_none());

    assert_eq!(first.await.unwrap_err().kind(), ErrorKind::Undefined);

    radio.set_responding(true);
    assert_eq!(radio.release_held(), 2);
    assert_eq!(second.await.unwrap(), vec![87]);
}

#[tokio::test]
async fn disconnect_while_connecting() {
    let (manager, radio) = powered_on(vec![heart_monitor()]).await;
    let peripheral = manager.peripheral(&MONITOR).unwrap();

    radio.set_responding(false);
    let mut connecting = Box::pin(peripheral.connect());
    assert!(poll_once(&mut connecting).await.is_none());
    assert_eq!(peripheral.state(), PeripheralState::Connecting);

    peripheral.disconnect();
    assert_eq!(peripheral.state(), PeripheralState::Disconnected);
    assert_eq!(connecting.await.unwrap_err().kind(), ErrorKind::NotConnected);
    assert!(radio.calls().contains(&RadioCall::CancelConnection(MONITOR)));
    assert_eq!(radio.release_held(), 0);
    assert!(!peripheral.is_connected());
}

#[tokio::test]
async fn notifications_stop_when_stream_dropped() {
    let (manager, radio) = powered_on(vec![heart_monitor()]).await;
    let peripheral = connected(&manager, MONITOR).await;
    let service = peripheral.discover_services(&[services::HEART_RATE]).await.unwrap().pop().unwrap();
    let measurement = service
        .discover_characteristics(&[characteristics::HEART_RATE_MEASUREMENT])
        .await
        .unwrap()
        .pop()
        .unwrap();

    let mut stream = measurement.notify().await.unwrap();
    assert!(measurement.is_notifying());
    assert!(radio.is_notifying(&measurement_path()));

    assert!(radio.notify_value(&measurement_path(), vec![0, 80]));
    assert!(radio.notify_value(&measurement_path(), vec![0, 82]));
    assert_eq!(stream.next().await, Some(vec![0, 80]));
    assert_eq!(stream.next().await, Some(vec![0, 82]));
    assert_eq!(measurement.value(), Some(vec![0, 82]));

    drop(stream);
    assert!(!measurement.is_notifying());
    assert!(!radio.is_notifying(&measurement_path()));
    assert!(!radio.notify_value(&measurement_path(), vec![0, 90]));
}

#[tokio::test]
async fn notifications_continue_while_any_stream_lives() {
    let (manager, radio) = powered_on(vec![heart_monitor()]).await;
    let peripheral = connected(&manager, MONITOR).await;
    let service = peripheral.discover_services(&[services::HEART_RATE]).await.unwrap().pop().unwrap();
    service.discover_characteristics(&[]).await.unwrap();
    let measurement = service.characteristic(&characteristics::HEART_RATE_MEASUREMENT).unwrap();

    let first = measurement.notify().await.unwrap();
    let mut second = measurement.notify().await.unwrap();
    let subscriptions = radio
        .calls()
        .into_iter()
        .filter(|x| matches!(x, RadioCall::SetNotify(_, true)))
        .count();
    assert_eq!(subscriptions, 1);

    drop(first);
    assert!(measurement.is_notifying());
    assert!(radio.is_notifying(&measurement_path()));
    assert!(radio.notify_value(&measurement_path(), vec![0, 75]));
    assert_eq!(second.next().await, Some(vec![0, 75]));

    drop(second);
    assert!(!measurement.is_notifying());
    assert!(!radio.is_notifying(&measurement_path()));
}

#[tokio::test]
async fn descriptor_read_and_write() {
    let (manager, _radio) = powered_on(vec![heart_monitor()]).await;
    let peripheral = connected(&manager, MONITOR).await;
    let service = peripheral.discover_services(&[services::HEART_RATE]).await.unwrap().pop().unwrap();
    service.discover_characteristics(&[]).await.unwrap();
    let measurement = service.characteristic(&characteristics::HEART_RATE_MEASUREMENT).unwrap();

    let found = measurement.discover_descriptors().await.unwrap();
    assert_eq!(found.len(), 1);
    let cccd = &found[0];
    assert_eq!(cccd.id(), descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION);
    assert_eq!(cccd.value(), Some(vec![0, 0]));

    cccd.write(&[1, 0]).await.unwrap();
    assert_eq!(cccd.read().await.unwrap(), vec![1, 0]);
    assert_eq!(cccd.value(), Some(vec![1, 0]));
    assert_eq!(measurement.descriptors(), found);
}

#[tokio::test]
async fn modified_services_are_invalidated() {
    let (manager, radio) = powered_on(vec![heart_monitor()]).await;
    let peripheral = connected(&manager, MONITOR).await;
    peripheral.discover_services(&[]).await.unwrap();
    let battery = peripheral.service(&services::BATTERY).unwrap();
    let level = battery.discover_characteristics(&[]).await.unwrap().pop().unwrap();

    radio.modify_services(&MONITOR, vec![heart_rate_service()]);
    assert!(battery.is_invalidated());
    assert!(level.is_invalidated());
    assert!(!peripheral.service(&services::HEART_RATE).unwrap().is_invalidated());
    assert_eq!(peripheral.services().len(), 1);

    let err = battery.discover_characteristics(&[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceInvalidated(services::BATTERY));
}

#[tokio::test]
async fn rssi_sampled_while_connected() {
    let (manager, radio) = powered_on(vec![heart_monitor()]).await;
    let peripheral = connected(&manager, MONITOR).await;
    radio.set_rssi(&MONITOR, -55);

    let mut rssi = peripheral.rssi_updates_every(Duration::from_millis(20));
    assert_eq!(rssi.next().await.unwrap().unwrap(), -55);
    assert_eq!(peripheral.rssi(), Some(-55));

    peripheral.disconnect();
    radio.clear_calls();
    assert!(tokio::time::timeout(Duration::from_millis(100), rssi.next()).await.is_err());
    assert!(!radio
        .calls()
        .iter()
        .any(|x| matches!(x, RadioCall::ReadSignalStrength(_))));
}

#[tokio::test]
async fn delayed_connect_completes_later() {
    let (manager, radio) = powered_on(vec![heart_monitor(), scale().not_connectable()]).await;

    let monitor = manager.peripheral(&MONITOR).unwrap();
    monitor
        .connect_with(Duration::from_millis(30), true, Default::default())
        .await
        .unwrap();
    assert!(monitor.is_connected());
    assert!(radio.is_connected(&MONITOR));

    let scale = manager.peripheral(&SCALE).unwrap();
    let err = scale.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    assert_eq!(scale.state(), PeripheralState::Disconnected);
}
