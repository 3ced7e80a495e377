use std::time::Duration;

use blueshift::emulation::{
    AuthorizationBehavior, EmulatedCentral, EmulatedCentralConfig, EmulatedManagerConfig, EmulatedPeripheral,
    EmulatedPeripheralRadio, EmulatedService, RadioCall,
};
use blueshift::{
    BluetoothId, CentralManager, Manager, ManagerAuthorization, ManagerState, Peripheral, PeripheralManager,
};
use futures_lite::StreamExt;
use tracing_subscriber::EnvFilter;

const PERIPHERAL1: BluetoothId = BluetoothId::from_u128(0xe25d7781_ebdd_440d_b2df_82321cf060c7);
const PERIPHERAL2: BluetoothId = BluetoothId::from_u128(0xef89e4b6_ee7d_404b_8e35_ea99f93b7077);
const SERVICE1: BluetoothId = BluetoothId::from_u128(0x47f474a1_dd88_4251_8cfa_58e1c4da1565);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn peripherals() -> Vec<EmulatedPeripheral> {
    vec![
        EmulatedPeripheral::random(),
        EmulatedPeripheral::new(PERIPHERAL1),
        EmulatedPeripheral::random(),
        EmulatedPeripheral::new(PERIPHERAL2).with_service(EmulatedService::new(SERVICE1)),
        EmulatedPeripheral::random(),
    ]
}

fn allowed() -> EmulatedManagerConfig {
    EmulatedManagerConfig {
        authorization: ManagerAuthorization::AllowedAlways,
        authorization_behavior: AuthorizationBehavior::Success,
        state: ManagerState::PoweredOn,
    }
}

#[tokio::test]
async fn paced_scan_reports_every_peripheral() {
    init_tracing();
    let config = EmulatedCentralConfig {
        manager: allowed(),
        scan_emit_rate: 0.05,
    };
    let manager = CentralManager::new(EmulatedCentral::new(config, peripherals()));
    assert!(!manager.is_scanning());

    let mut scan = manager.scan(&[]);
    let first = scan.next().await.unwrap().unwrap();
    assert!(manager.is_scanning());

    let mut found = vec![first];
    while let Some(peripheral) = scan.next().await {
        found.push(peripheral.unwrap());
    }
    assert_eq!(found.len(), 5);
    assert_eq!(found[1].id(), PERIPHERAL1);
    assert_eq!(found[3].id(), PERIPHERAL2);
    assert!(!manager.is_scanning());
}

#[tokio::test]
async fn dropping_paced_scan_stops_it() {
    init_tracing();
    let config = EmulatedCentralConfig {
        manager: allowed(),
        scan_emit_rate: 0.05,
    };
    let radio = EmulatedCentral::new(config, peripherals());
    let manager = CentralManager::new(radio.clone());

    let mut scan = manager.scan(&[]);
    scan.next().await.unwrap().unwrap();
    drop(scan);
    assert!(!manager.is_scanning());
    assert!(!radio.is_scanning());
    assert_eq!(radio.calls().last(), Some(&RadioCall::StopScan));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(manager.peripherals().len(), 1);
}

#[tokio::test]
async fn peripheral_with_identifier() {
    init_tracing();
    let manager = CentralManager::new(EmulatedCentral::new(EmulatedCentralConfig::default(), peripherals()));
    let peripheral = manager.peripheral(&PERIPHERAL1).unwrap();
    assert_eq!(peripheral.id(), PERIPHERAL1);
    assert_eq!(manager.peripheral(&PERIPHERAL1), Some(peripheral));
    assert!(manager.peripheral(&SERVICE1).is_none());
}

#[tokio::test]
async fn connected_peripherals_filter_by_service() {
    init_tracing();
    let manager = CentralManager::new(EmulatedCentral::new(EmulatedCentralConfig::default(), peripherals()));
    let connected: Vec<Peripheral> = manager.connected_peripherals(&[SERVICE1]);
    assert_eq!(connected.len(), 1);
    assert_eq!(connected[0].id(), PERIPHERAL2);
    assert!(manager.connected_peripherals(&[]).is_empty());
}

#[tokio::test]
async fn denied_authorization_transitions_once() {
    init_tracing();
    let radio = EmulatedCentral::new(EmulatedCentralConfig::default(), Vec::new());
    let manager = CentralManager::new(radio.clone());
    assert_eq!(manager.authorization(), ManagerAuthorization::NotDetermined);
    assert_eq!(manager.state(), ManagerState::Unknown);

    let mut updates = manager.authorization_updates();
    assert_eq!(updates.next().await, Some(ManagerAuthorization::NotDetermined));

    manager.request_authorization();
    assert_eq!(updates.next().await, Some(ManagerAuthorization::Denied));
    assert_eq!(manager.state(), ManagerState::Unauthorized);
    assert!(!manager.is_authorized());

    manager.request_authorization();
    assert_eq!(radio.calls(), vec![RadioCall::Initialize]);
    assert!(tokio::time::timeout(Duration::from_millis(50), updates.next()).await.is_err());
}

#[tokio::test]
async fn granted_authorization_powers_on() {
    init_tracing();
    let config = EmulatedManagerConfig {
        authorization_behavior: AuthorizationBehavior::Success,
        ..Default::default()
    };
    let manager = PeripheralManager::new(EmulatedPeripheralRadio::new(config));
    let mut states = manager.state_updates();
    assert_eq!(states.next().await, Some(ManagerState::Unknown));

    manager.request_authorization();
    assert_eq!(states.next().await, Some(ManagerState::PoweredOn));
    assert!(manager.is_authorized());
    manager.ensure_ready(false).await.unwrap();
}

#[tokio::test]
async fn settled_radio_ignores_authorization_request() {
    init_tracing();
    let radio = EmulatedCentral::new(EmulatedCentralConfig::immediate(allowed()), Vec::new());
    let manager = CentralManager::new(radio.clone());
    manager.request_authorization();
    assert_eq!(manager.authorization(), ManagerAuthorization::AllowedAlways);
    assert_eq!(manager.state(), ManagerState::PoweredOn);
    assert_eq!(radio.calls(), vec![RadioCall::Initialize]);
}

#[tokio::test]
async fn failing_authorization_revokes_allowed_radio() {
    init_tracing();
    let config = EmulatedManagerConfig {
        authorization: ManagerAuthorization::AllowedAlways,
        authorization_behavior: AuthorizationBehavior::Failure,
        state: ManagerState::PoweredOn,
    };
    let radio = EmulatedCentral::new(EmulatedCentralConfig::immediate(config), Vec::new());
    let manager = CentralManager::new(radio.clone());
    assert!(manager.is_authorized());

    manager.request_authorization();
    assert_eq!(manager.authorization(), ManagerAuthorization::Denied);
    assert_eq!(manager.state(), ManagerState::Unauthorized);
    assert_eq!(manager.ensure_ready(false).await.unwrap_err().kind(), blueshift::error::ErrorKind::NotAuthorized);
}

#[tokio::test]
async fn granting_authorization_overrides_earlier_denial() {
    init_tracing();
    let config = EmulatedManagerConfig {
        authorization: ManagerAuthorization::Denied,
        authorization_behavior: AuthorizationBehavior::Success,
        state: ManagerState::Unauthorized,
    };
    let manager = PeripheralManager::new(EmulatedPeripheralRadio::new(config));
    manager.request_authorization();
    assert_eq!(manager.authorization(), ManagerAuthorization::AllowedAlways);
    assert_eq!(manager.state(), ManagerState::PoweredOn);
}

#[test]
fn scan_interval_from_rate() {
    assert_eq!(EmulatedCentralConfig::default().scan_interval(), Duration::from_secs(2));
    let config = EmulatedCentralConfig {
        scan_emit_rate: -1.0,
        ..Default::default()
    };
    assert_eq!(config.scan_interval(), Duration::ZERO);
    assert_eq!(
        EmulatedCentralConfig::immediate(allowed()).scan_interval(),
        Duration::ZERO
    );
}

#[cfg(feature = "serde")]
#[test]
fn configuration_from_environment() {
    use blueshift::error::ErrorKind;

    std::env::remove_var(EmulatedCentralConfig::ENVIRONMENT_KEY);
    assert_eq!(EmulatedCentralConfig::from_env().unwrap(), EmulatedCentralConfig::default());

    std::env::set_var(
        EmulatedCentralConfig::ENVIRONMENT_KEY,
        r#"{"authorization":"allowedAlways","state":"poweredOn","scanEmitRate":0.5}"#,
    );
    let config = EmulatedCentralConfig::from_env().unwrap();
    assert_eq!(config.manager.authorization, ManagerAuthorization::AllowedAlways);
    assert_eq!(config.manager.state, ManagerState::PoweredOn);
    assert_eq!(config.manager.authorization_behavior, AuthorizationBehavior::Failure);
    assert_eq!(config.scan_interval(), Duration::from_millis(500));

    std::env::set_var(EmulatedCentralConfig::ENVIRONMENT_KEY, "{");
    let err = EmulatedCentralConfig::from_env().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Undefined);
    std::env::remove_var(EmulatedCentralConfig::ENVIRONMENT_KEY);
}
