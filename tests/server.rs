use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use blueshift::btuuid::{characteristics, services};
use blueshift::emulation::{AuthorizationBehavior, EmulatedManagerConfig, EmulatedPeripheralRadio, ValueUpdate};
use blueshift::error::{AttError, AttErrorCode, ErrorKind};
use blueshift::{
    AdvertisementData, AttributePermissions, BluetoothId, CharacteristicHandler, CharacteristicProperties, Manager,
    ManagerState, MutableCharacteristic, MutableService, PeripheralManager, Result,
};
use futures_lite::future::poll_once;
use tracing_subscriber::EnvFilter;

const CENTRAL_A: BluetoothId = BluetoothId::from_u128(0x5b1c8f0e_2d44_4b7a_9e61_0c3a7f9d2e10);
const CENTRAL_B: BluetoothId = BluetoothId::from_u128(0x8a7d3c21_6f15_4e0b_b2a9_41d8e6c05f33);

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

fn battery_level() -> MutableCharacteristic {
    MutableCharacteristic::new(
        characteristics::BATTERY_LEVEL,
        CharacteristicProperties {
            read: true,
            write: true,
            notify: true,
            ..Default::default()
        },
        AttributePermissions {
            readable: true,
            writeable: true,
            ..Default::default()
        },
    )
}

fn setup(level: &MutableCharacteristic) -> (PeripheralManager, EmulatedPeripheralRadio) {
    init_tracing();
    let radio = EmulatedPeripheralRadio::new(granted());
    let manager = PeripheralManager::new(radio.clone());
    manager.add_service(MutableService::new(services::BATTERY, true).with_characteristic(level.clone()));
    manager.set_advertisement_data(AdvertisementData {
        local_name: Some("Blueshift".to_owned()),
        ..Default::default()
    });
    manager.request_authorization();
    (manager, radio)
}

#[tokio::test]
async fn advertising_publishes_and_stops() {
    let level = battery_level();
    let (manager, radio) = setup(&level);

    let mut advertising = Box::pin(manager.begin_advertising());
    assert!(poll_once(&mut advertising).await.is_none());
    assert!(manager.is_advertising());
    assert!(radio.is_advertising());
    assert_eq!(radio.advertised_data().unwrap().local_name.as_deref(), Some("Blueshift"));
    let published = radio.published_services();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].id(), services::BATTERY);
    assert_eq!(published[0].name(manager.registry()), "Battery");

    manager.stop_advertising();
    advertising.await.unwrap();
    assert!(!manager.is_advertising());
    assert!(!radio.is_advertising());
    assert!(radio.published_services().is_empty());
}

#[tokio::test]
async fn remote_reads_are_answered() {
    let level = battery_level();
    level.set_value(vec![90]);
    let (manager, radio) = setup(&level);
    let mut advertising = Box::pin(manager.begin_advertising());
    assert!(poll_once(&mut advertising).await.is_none());

    let response = radio.request_read(CENTRAL_A, characteristics::BATTERY_LEVEL, 0).unwrap();
    assert_eq!(response.result, AttError::Known(AttErrorCode::Success));
    assert_eq!(response.value, Some(vec![90]));

    let response = radio.request_read(CENTRAL_A, characteristics::BATTERY_LEVEL, 5).unwrap();
    assert_eq!(response.result, AttErrorCode::AttributeNotLong.into());
    assert_eq!(response.value, None);

    let response = radio.request_read(CENTRAL_A, characteristics::DEVICE_NAME, 0).unwrap();
    assert_eq!(response.result, AttErrorCode::AttributeNotFound.into());
    assert_eq!(radio.responses().len(), 3);
}

#[tokio::test]
async fn remote_writes_update_stored_value() {
    let level = battery_level();
    let (manager, radio) = setup(&level);
    let mut advertising = Box::pin(manager.begin_advertising());
    assert!(poll_once(&mut advertising).await.is_none());
    radio.subscribe(CENTRAL_B, characteristics::BATTERY_LEVEL);

    let responses = radio.request_writes(
        CENTRAL_A,
        vec![
            (characteristics::BATTERY_LEVEL, 0, vec![1, 2, 3]),
            (characteristics::BATTERY_LEVEL, 3, vec![4]),
            (characteristics::DEVICE_NAME, 0, vec![5]),
        ],
    );
    let results: Vec<AttError> = responses.iter().map(|x| x.result).collect();
    assert_eq!(
        results,
        vec![
            AttErrorCode::Success.into(),
            AttErrorCode::Success.into(),
            AttErrorCode::AttributeNotFound.into()
        ]
    );
    assert_eq!(level.value(), Some(vec![1, 2, 3, 4]));
    assert!(radio.updates().is_empty());

    let response = radio.request_write(CENTRAL_A, characteristics::BATTERY_LEVEL, 9, vec![0]).unwrap();
    assert_eq!(response.result, AttErrorCode::AttributeNotLong.into());
    assert_eq!(level.value(), Some(vec![1, 2, 3, 4]));
}

#[tokio::test]
async fn updates_reach_only_subscribers() {
    let level = battery_level();
    let (manager, radio) = setup(&level);

    level.set_value(vec![100]);
    assert_eq!(level.value(), Some(vec![100]));

    let mut advertising = Box::pin(manager.begin_advertising());
    assert!(poll_once(&mut advertising).await.is_none());

    radio.subscribe(CENTRAL_A, characteristics::BATTERY_LEVEL);
    radio.subscribe(CENTRAL_A, characteristics::BATTERY_LEVEL);
    assert_eq!(manager.subscribers(&characteristics::BATTERY_LEVEL), vec![CENTRAL_A]);
    level.set_value(vec![80]);

    radio.subscribe(CENTRAL_B, characteristics::BATTERY_LEVEL);
    radio.unsubscribe(CENTRAL_A, characteristics::BATTERY_LEVEL);
    level.set_value(vec![70]);

    radio.unsubscribe(CENTRAL_B, characteristics::BATTERY_LEVEL);
    level.set_value(vec![60]);

    assert_eq!(
        radio.updates(),
        vec![
            ValueUpdate {
                characteristic: characteristics::BATTERY_LEVEL,
                value: vec![80],
                subscribers: vec![CENTRAL_A],
            },
            ValueUpdate {
                characteristic: characteristics::BATTERY_LEVEL,
                value: vec![70],
                subscribers: vec![CENTRAL_B],
            },
        ]
    );

    manager.stop_advertising();
    advertising.await.unwrap();
    level.set_value(vec![50]);
    assert_eq!(radio.updates().len(), 2);
}

struct Clock {
    reads: Arc<AtomicUsize>,
}

impl CharacteristicHandler for Clock {
    fn read(&self, _characteristic: &MutableCharacteristic, offset: usize) -> Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if offset > 0 {
            return Err(ErrorKind::NotSupported.into());
        }
        Ok(vec![12, 30])
    }
}

#[tokio::test]
async fn handler_answers_remote_requests() {
    let reads = Arc::new(AtomicUsize::new(0));
    let time = MutableCharacteristic::with_handler(
        characteristics::CURRENT_TIME,
        CharacteristicProperties {
            read: true,
            write: true,
            ..Default::default()
        },
        AttributePermissions {
            readable: true,
            writeable: true,
            ..Default::default()
        },
        Clock { reads: reads.clone() },
    );
    let (manager, radio) = setup(&time);
    manager.set_services(vec![MutableService::new(services::CURRENT_TIME, true).with_characteristic(time.clone())]);
    let mut advertising = Box::pin(manager.begin_advertising());
    assert!(poll_once(&mut advertising).await.is_none());

    let response = radio.request_read(CENTRAL_A, characteristics::CURRENT_TIME, 0).unwrap();
    assert_eq!(response.value, Some(vec![12, 30]));
    let response = radio.request_read(CENTRAL_A, characteristics::CURRENT_TIME, 1).unwrap();
    assert_eq!(response.result, AttErrorCode::AttributeNotLong.into());
    assert_eq!(reads.load(Ordering::SeqCst), 2);

    // writes fall back to the stored value
    let response = radio.request_write(CENTRAL_A, characteristics::CURRENT_TIME, 0, vec![7]).unwrap();
    assert!(response.result.is_success());
    assert_eq!(time.value(), Some(vec![7]));
}

#[tokio::test]
async fn failed_start_ends_advertising() {
    let level = battery_level();
    let (manager, radio) = setup(&level);
    radio.set_advertising_failure(Some(Arc::new(std::io::Error::new(std::io::ErrorKind::Other, "busy"))));

    let err = manager.begin_advertising().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Undefined);
    assert!(!manager.is_advertising());
    assert!(radio.published_services().is_empty());
}

#[tokio::test]
async fn power_loss_fails_advertising() {
    let level = battery_level();
    let (manager, radio) = setup(&level);
    let mut advertising = Box::pin(manager.begin_advertising());
    assert!(poll_once(&mut advertising).await.is_none());

    radio.set_state(ManagerState::PoweredOff);
    assert_eq!(advertising.await.unwrap_err().kind(), ErrorKind::NotConnected);
    assert!(!manager.is_advertising());
}

#[tokio::test]
async fn unauthorized_radio_cannot_advertise() {
    init_tracing();
    let manager = PeripheralManager::new(EmulatedPeripheralRadio::new(EmulatedManagerConfig::default()));
    let advertising = manager.begin_advertising();
    manager.request_authorization();
    assert_eq!(advertising.await.unwrap_err().kind(), ErrorKind::NotPoweredOn);
}

#[tokio::test]
async fn dropping_advertising_stops_it() {
    let level = battery_level();
    let (manager, radio) = setup(&level);
    let mut advertising = Box::pin(manager.begin_advertising());
    assert!(poll_once(&mut advertising).await.is_none());
    radio.subscribe(CENTRAL_A, characteristics::BATTERY_LEVEL);

    drop(advertising);
    assert!(!manager.is_advertising());
    assert!(!radio.is_advertising());
    assert!(manager.subscribers(&characteristics::BATTERY_LEVEL).is_empty());

    level.set_value(vec![1]);
    assert!(radio.updates().is_empty());
}

#[tokio::test]
async fn new_session_replaces_previous() {
    let level = battery_level();
    let (manager, radio) = setup(&level);
    let mut first = Box::pin(manager.begin_advertising());
    assert!(poll_once(&mut first).await.is_none());
    let mut second = Box::pin(manager.begin_advertising());
    assert!(poll_once(&mut second).await.is_none());

    first.await.unwrap();
    assert!(manager.is_advertising());
    assert!(radio.is_advertising());
    assert_eq!(radio.published_services().len(), 1);

    drop(second);
    assert!(!radio.is_advertising());
}
