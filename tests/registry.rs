use blueshift::btuuid::{characteristics, services};
use blueshift::emulation::{
    AuthorizationBehavior, EmulatedCentral, EmulatedCentralConfig, EmulatedManagerConfig, EmulatedPeripheral,
    EmulatedService,
};
use blueshift::{BluetoothId, CentralManager, CentralManagerOptions, GattRegistry, GattSpecification, Manager};

const THERMOSTAT: BluetoothId = BluetoothId::from_u128(0x9d1f6c3a_0b7e_4f42_8a55_e2c4b19d7a01);
const SETPOINT: BluetoothId = BluetoothId::from_u128(0x9d1f6c3b_0b7e_4f42_8a55_e2c4b19d7a01);

#[test]
fn standard_names() {
    let registry = GattRegistry::new();
    assert_eq!(registry.service_name(&services::BATTERY), "Battery");
    assert_eq!(registry.characteristic_name(&characteristics::HEART_RATE_MEASUREMENT), "Heart Rate Measurement");

    let battery = registry.service_by_identifier("ORG.BLUETOOTH.SERVICE.BATTERY_SERVICE").unwrap();
    assert_eq!(battery.id, services::BATTERY);
    let level = registry
        .characteristic_by_identifier("org.bluetooth.characteristic.battery_level")
        .unwrap();
    assert_eq!(level.id, characteristics::BATTERY_LEVEL);
}

#[test]
fn unknown_names_fall_back_to_identifier() {
    let registry = GattRegistry::new();
    assert_eq!(
        registry.service_name(&THERMOSTAT),
        "Service '9D1F6C3A-0B7E-4F42-8A55-E2C4B19D7A01'"
    );
    assert_eq!(
        registry.characteristic_name(&SETPOINT),
        "Characteristic '9D1F6C3B-0B7E-4F42-8A55-E2C4B19D7A01'"
    );
    assert!(registry.service(&THERMOSTAT).is_none());
}

#[test]
fn custom_entries_override_and_deregister() {
    let registry = GattRegistry::new();
    registry.register_service(GattSpecification::new(THERMOSTAT, "Thermostat", Some("com.example.thermostat".into())));
    registry.register_service(GattSpecification::new(services::BATTERY, "Power Cell", None));
    registry.register_characteristic(GattSpecification::new(SETPOINT, "Setpoint", None));

    assert_eq!(registry.service_name(&THERMOSTAT), "Thermostat");
    assert_eq!(registry.service_name(&services::BATTERY), "Power Cell");
    assert_eq!(registry.characteristic_name(&SETPOINT), "Setpoint");
    assert_eq!(
        registry.service_by_identifier("Com.Example.Thermostat").map(|x| x.id),
        Some(THERMOSTAT)
    );
    assert_eq!(registry.custom_services().len(), 2);

    registry.register_service(GattSpecification::new(THERMOSTAT, "Climate", None));
    assert_eq!(registry.custom_services().len(), 2);
    assert_eq!(registry.service_name(&THERMOSTAT), "Climate");

    assert!(registry.deregister_service(&services::BATTERY));
    assert!(!registry.deregister_service(&services::BATTERY));
    assert_eq!(registry.service_name(&services::BATTERY), "Battery");

    assert!(registry.deregister_characteristic(&SETPOINT));
    assert!(registry.custom_characteristics().is_empty());
}

#[test]
fn clones_share_custom_entries() {
    let registry = GattRegistry::new();
    let clone = registry.clone();
    clone.register_service(GattSpecification::new(THERMOSTAT, "Thermostat", None));
    assert_eq!(registry.service_name(&THERMOSTAT), "Thermostat");
}

#[tokio::test]
async fn manager_names_services_with_its_registry() {
    let registry = GattRegistry::new();
    registry.register_service(GattSpecification::new(THERMOSTAT, "Thermostat", None));

    let config = EmulatedCentralConfig::immediate(EmulatedManagerConfig {
        authorization_behavior: AuthorizationBehavior::Success,
        ..Default::default()
    });
    let peripheral = EmulatedPeripheral::random().with_service(EmulatedService::new(THERMOSTAT));
    let id = peripheral.id;
    let manager = CentralManager::with_options(
        EmulatedCentral::new(config, vec![peripheral]),
        registry,
        CentralManagerOptions::default(),
    );
    manager.request_authorization();

    let peripheral = manager.peripheral(&id).unwrap();
    peripheral.connect().await.unwrap();
    let discovered = peripheral.discover_services(&[]).await.unwrap();
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].name(), "Thermostat");
    assert_eq!(manager.registry().custom_services().len(), 1);
}
