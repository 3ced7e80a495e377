#![allow(clippy::let_unit_value)]

use blueshift::*;
use futures_lite::StreamExt;

fn assert_send<T: Send>(t: T) -> T {
    t
}

async fn check_manager_apis(manager: CentralManager) -> Result<Peripheral> {
    manager.request_authorization();
    let _state: Option<ManagerState> = assert_send(manager.state_updates().next()).await;
    let _authorization: Option<ManagerAuthorization> = assert_send(manager.authorization_updates().next()).await;
    let _ready: Result<()> = assert_send(manager.ensure_ready(true)).await;

    let _scanning: Option<bool> = assert_send(manager.scanning_updates().next()).await;
    let mut scan = assert_send(manager.scan(&[btuuid::services::GENERIC_ACCESS]));
    let _peripheral: Option<Result<Peripheral>> = assert_send(scan.next()).await;
    manager.stop_scan();

    let connected: Vec<Peripheral> = manager.connected_peripherals(&[btuuid::services::GENERIC_ACCESS]);
    let peripheral = connected.into_iter().next().unwrap();
    let _same: Option<Peripheral> = manager.peripheral(&peripheral.id());

    Ok(peripheral)
}

async fn check_peripheral_apis(peripheral: Peripheral) -> Result<Service> {
    let _id: BluetoothId = peripheral.id();
    let _name: String = peripheral.name();
    let _state: PeripheralState = peripheral.state();
    let _connected: Option<bool> = assert_send(peripheral.connection_updates().next()).await;

    let _res: Result<()> = assert_send(peripheral.connect()).await;
    let _res: Result<()> = assert_send(peripheral.connect_with(
        std::time::Duration::from_millis(10),
        false,
        ConnectOptions::default(),
    ))
    .await;

    let _discovery: Result<Vec<Service>> = assert_send(peripheral.discover_services(&[])).await;
    let _rssi: Option<Result<i16>> = assert_send(peripheral.rssi_updates().next()).await;
    let service: Result<Service> = peripheral.service(&btuuid::services::GENERIC_ACCESS);
    peripheral.disconnect();

    service
}

async fn check_service_apis(service: Service) -> Result<Characteristic> {
    let _id: BluetoothId = service.id();
    let _is_primary: bool = service.is_primary();

    let _discovery: Result<Vec<Characteristic>> =
        assert_send(service.discover_characteristics(&[btuuid::characteristics::DEVICE_NAME])).await;
    service.characteristic(&btuuid::characteristics::DEVICE_NAME)
}

async fn check_characteristic_apis(characteristic: Characteristic) -> Result<Descriptor> {
    let _props: CharacteristicProperties = characteristic.properties();
    let _value: Option<Vec<u8>> = characteristic.value();
    let _value: Result<Vec<u8>> = assert_send(characteristic.read()).await;
    let _res: Result<()> = assert_send(characteristic.write(&[0u8])).await;
    let _res: Result<()> = characteristic.write_without_response(&[0u8]);

    let notifications: Result<_> = assert_send(characteristic.notify()).await;
    let _notification: Option<Vec<u8>> = assert_send(notifications?.next()).await;
    let _is_notifying: bool = characteristic.is_notifying();
    let _subscribed: Result<bool> = assert_send(characteristic.unsubscribe_from_changes()).await;

    let descriptors: Result<Vec<Descriptor>> = assert_send(characteristic.discover_descriptors()).await;
    Ok(descriptors?.into_iter().next().unwrap())
}

async fn check_descriptor_apis(descriptor: Descriptor) -> Result<()> {
    let _id: BluetoothId = descriptor.id();
    let _value: Option<Vec<u8>> = descriptor.value();
    let _value: Result<Vec<u8>> = assert_send(descriptor.read()).await;
    let _res: Result<()> = assert_send(descriptor.write(&[0u8])).await;

    Ok(())
}

async fn check_server_apis(manager: PeripheralManager) -> Result<()> {
    let characteristic = MutableCharacteristic::new(
        btuuid::characteristics::BATTERY_LEVEL,
        CharacteristicProperties::default(),
        AttributePermissions::default(),
    );
    manager.add_service(MutableService::new(btuuid::services::BATTERY, true).with_characteristic(characteristic.clone()));
    let _ready: Result<()> = assert_send(manager.ensure_ready(false)).await;
    let _advertising: Option<bool> = assert_send(manager.advertising_updates().next()).await;
    characteristic.set_value(vec![100]);
    assert_send(manager.begin_advertising()).await
}

#[allow(unused)]
async fn check_apis() -> Result<()> {
    let radio = emulation::EmulatedCentral::new(emulation::EmulatedCentralConfig::default(), Vec::new());
    let peripheral = check_manager_apis(CentralManager::new(radio)).await?;
    let service = check_peripheral_apis(peripheral).await?;
    let characteristic = check_service_apis(service).await?;
    let descriptor = check_characteristic_apis(characteristic).await?;
    check_descriptor_apis(descriptor).await?;

    let radio = emulation::EmulatedPeripheralRadio::new(emulation::EmulatedManagerConfig::default());
    check_server_apis(PeripheralManager::new(radio)).await
}

fn main() {}
