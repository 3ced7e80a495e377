//! Names and identifiers of GATT services and characteristics
//!
//! A [`GattRegistry`] resolves a [`BluetoothId`] to a human readable [`GattSpecification`]. Every registry knows the
//! standard services and characteristics adopted by the Bluetooth SIG; applications register their own custom
//! attributes on top. Clones of a registry share their custom entries.

use std::sync::{Arc, PoisonError, RwLock};

use crate::BluetoothId;

/// Descriptive information about a GATT service or characteristic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(rename_all = "camelCase"))]
pub struct GattSpecification {
    /// The attribute type
    pub id: BluetoothId,
    /// The name shown to people, e.g. "Heart Rate"
    pub common_name: String,
    /// The reverse-DNS identifier of the specification, e.g. `org.bluetooth.service.heart_rate`
    pub identifier: Option<String>,
}

impl GattSpecification {
    /// Creates a specification entry.
    pub fn new(id: BluetoothId, common_name: impl Into<String>, identifier: Option<String>) -> Self {
        GattSpecification {
            id,
            common_name: common_name.into(),
            identifier,
        }
    }

    fn standard(&(id, common_name, identifier): &(u16, &str, &str)) -> Self {
        GattSpecification {
            id: BluetoothId::from_u16(id),
            common_name: common_name.to_owned(),
            identifier: Some(identifier.to_owned()),
        }
    }
}

/// Lookup table for GATT service and characteristic names.
#[derive(Clone, Default)]
pub struct GattRegistry(Arc<RwLock<Custom>>);

#[derive(Default)]
struct Custom {
    services: Vec<GattSpecification>,
    characteristics: Vec<GattSpecification>,
}

impl GattRegistry {
    /// Creates a registry holding only the standard entries.
    pub fn new() -> Self {
        Self::default()
    }

    fn read<R>(&self, f: impl FnOnce(&Custom) -> R) -> R {
        f(&self.0.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<R>(&self, f: impl FnOnce(&mut Custom) -> R) -> R {
        f(&mut self.0.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Adds a custom service, replacing any custom service with the same identifier.
    pub fn register_service(&self, specification: GattSpecification) {
        self.write(|custom| upsert(&mut custom.services, specification));
    }

    /// Removes the custom service `id`. Returns `false` if it was not registered.
    pub fn deregister_service(&self, id: &BluetoothId) -> bool {
        self.write(|custom| remove(&mut custom.services, id))
    }

    /// Adds a custom characteristic, replacing any custom characteristic with the same identifier.
    pub fn register_characteristic(&self, specification: GattSpecification) {
        self.write(|custom| upsert(&mut custom.characteristics, specification));
    }

    /// Removes the custom characteristic `id`. Returns `false` if it was not registered.
    pub fn deregister_characteristic(&self, id: &BluetoothId) -> bool {
        self.write(|custom| remove(&mut custom.characteristics, id))
    }

    /// Looks up a service. Custom entries take precedence over standard ones.
    pub fn service(&self, id: &BluetoothId) -> Option<GattSpecification> {
        self.read(|custom| lookup(&custom.services, STANDARD_SERVICES, |x| x.id == *id))
    }

    /// Looks up a characteristic. Custom entries take precedence over standard ones.
    pub fn characteristic(&self, id: &BluetoothId) -> Option<GattSpecification> {
        self.read(|custom| lookup(&custom.characteristics, STANDARD_CHARACTERISTICS, |x| x.id == *id))
    }

    /// Looks up a service by its reverse-DNS identifier, ignoring case.
    pub fn service_by_identifier(&self, identifier: &str) -> Option<GattSpecification> {
        self.read(|custom| lookup(&custom.services, STANDARD_SERVICES, |x| matches_identifier(x, identifier)))
    }

    /// Looks up a characteristic by its reverse-DNS identifier, ignoring case.
    pub fn characteristic_by_identifier(&self, identifier: &str) -> Option<GattSpecification> {
        self.read(|custom| {
            lookup(&custom.characteristics, STANDARD_CHARACTERISTICS, |x| {
                matches_identifier(x, identifier)
            })
        })
    }

    /// The common name of service `id`, or `Service '<id>'` if it is unknown.
    pub fn service_name(&self, id: &BluetoothId) -> String {
        self.service(id)
            .map(|x| x.common_name)
            .unwrap_or_else(|| format!("Service '{id}'"))
    }

    /// The common name of characteristic `id`, or `Characteristic '<id>'` if it is unknown.
    pub fn characteristic_name(&self, id: &BluetoothId) -> String {
        self.characteristic(id)
            .map(|x| x.common_name)
            .unwrap_or_else(|| format!("Characteristic '{id}'"))
    }

    /// Every custom service, in registration order
    pub fn custom_services(&self) -> Vec<GattSpecification> {
        self.read(|custom| custom.services.clone())
    }

    /// Every custom characteristic, in registration order
    pub fn custom_characteristics(&self) -> Vec<GattSpecification> {
        self.read(|custom| custom.characteristics.clone())
    }
}

impl std::fmt::Debug for GattRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.read(|custom| {
            f.debug_struct("GattRegistry")
                .field("custom_services", &custom.services.len())
                .field("custom_characteristics", &custom.characteristics.len())
                .finish()
        })
    }
}

fn upsert(entries: &mut Vec<GattSpecification>, specification: GattSpecification) {
    match entries.iter_mut().find(|x| x.id == specification.id) {
        Some(entry) => *entry = specification,
        None => entries.push(specification),
    }
}

fn remove(entries: &mut Vec<GattSpecification>, id: &BluetoothId) -> bool {
    let len = entries.len();
    entries.retain(|x| x.id != *id);
    entries.len() != len
}

fn lookup(
    custom: &[GattSpecification],
    standard: &[(u16, &str, &str)],
    mut predicate: impl FnMut(&GattSpecification) -> bool,
) -> Option<GattSpecification> {
    custom
        .iter()
        .find(|x| predicate(x))
        .cloned()
        .or_else(|| standard.iter().map(GattSpecification::standard).find(predicate))
}

fn matches_identifier(specification: &GattSpecification, identifier: &str) -> bool {
    specification
        .identifier
        .as_deref()
        .is_some_and(|x| x.eq_ignore_ascii_case(identifier))
}

const STANDARD_SERVICES: &[(u16, &str, &str)] = &[
    (0x1800, "Generic Access", "org.bluetooth.service.generic_access"),
    (0x1801, "Generic Attribute", "org.bluetooth.service.generic_attribute"),
    (0x1802, "Immediate Alert", "org.bluetooth.service.immediate_alert"),
    (0x1803, "Link Loss", "org.bluetooth.service.link_loss"),
    (0x1804, "Tx Power", "org.bluetooth.service.tx_power"),
    (0x1805, "Current Time", "org.bluetooth.service.current_time"),
    (0x1806, "Reference Time Update", "org.bluetooth.service.reference_time_update"),
    (0x1807, "Next DST Change", "org.bluetooth.service.next_dst_change"),
    (0x1808, "Glucose", "org.bluetooth.service.glucose"),
    (0x1809, "Health Thermometer", "org.bluetooth.service.health_thermometer"),
    (0x180a, "Device Information", "org.bluetooth.service.device_information"),
    (0x180d, "Heart Rate", "org.bluetooth.service.heart_rate"),
    (0x180e, "Phone Alert Status", "org.bluetooth.service.phone_alert_status"),
    (0x180f, "Battery", "org.bluetooth.service.battery_service"),
    (0x1810, "Blood Pressure", "org.bluetooth.service.blood_pressure"),
    (0x1811, "Alert Notification", "org.bluetooth.service.alert_notification"),
    (0x1812, "Human Interface Device", "org.bluetooth.service.human_interface_device"),
    (0x1813, "Scan Parameters", "org.bluetooth.service.scan_parameters"),
    (0x1814, "Running Speed and Cadence", "org.bluetooth.service.running_speed_and_cadence"),
    (0x1815, "Automation IO", "org.bluetooth.service.automation_io"),
    (0x1816, "Cycling Speed and Cadence", "org.bluetooth.service.cycling_speed_and_cadence"),
    (0x1818, "Cycling Power", "org.bluetooth.service.cycling_power"),
    (0x1819, "Location and Navigation", "org.bluetooth.service.location_and_navigation"),
    (0x181a, "Environmental Sensing", "org.bluetooth.service.environmental_sensing"),
    (0x181b, "Body Composition", "org.bluetooth.service.body_composition"),
    (0x181c, "User Data", "org.bluetooth.service.user_data"),
    (0x181d, "Weight Scale", "org.bluetooth.service.weight_scale"),
    (0x181e, "Bond Management", "org.bluetooth.service.bond_management"),
    (0x181f, "Continuous Glucose Monitoring", "org.bluetooth.service.continuous_glucose_monitoring"),
    (0x1820, "Internet Protocol Support", "org.bluetooth.service.internet_protocol_support"),
    (0x1821, "Indoor Positioning", "org.bluetooth.service.indoor_positioning"),
    (0x1822, "Pulse Oximeter", "org.bluetooth.service.pulse_oximeter"),
    (0x1823, "HTTP Proxy", "org.bluetooth.service.http_proxy"),
    (0x1824, "Transport Discovery", "org.bluetooth.service.transport_discovery"),
    (0x1825, "Object Transfer", "org.bluetooth.service.object_transfer"),
    (0x1826, "Fitness Machine", "org.bluetooth.service.fitness_machine"),
    (0x1827, "Mesh Provisioning", "org.bluetooth.service.mesh_provisioning"),
    (0x1828, "Mesh Proxy", "org.bluetooth.service.mesh_proxy"),
    (0x1829, "Reconnection Configuration", "org.bluetooth.service.reconnection_configuration"),
    (0x183a, "Insulin Delivery", "org.bluetooth.service.insulin_delivery"),
    (0x183b, "Binary Sensor", "org.bluetooth.service.binary_sensor"),
    (0x183c, "Emergency Configuration", "org.bluetooth.service.emergency_configuration"),
];

const STANDARD_CHARACTERISTICS: &[(u16, &str, &str)] = &[
    (0x2a00, "Device Name", "org.bluetooth.characteristic.gap.device_name"),
    (0x2a01, "Appearance", "org.bluetooth.characteristic.gap.appearance"),
    (
        0x2a04,
        "Peripheral Preferred Connection Parameters",
        "org.bluetooth.characteristic.gap.peripheral_preferred_connection_parameters",
    ),
    (0x2a05, "Service Changed", "org.bluetooth.characteristic.gatt.service_changed"),
    (0x2a06, "Alert Level", "org.bluetooth.characteristic.alert_level"),
    (0x2a07, "Tx Power Level", "org.bluetooth.characteristic.tx_power_level"),
    (0x2a08, "Date Time", "org.bluetooth.characteristic.date_time"),
    (0x2a0f, "Local Time Information", "org.bluetooth.characteristic.local_time_information"),
    (0x2a18, "Glucose Measurement", "org.bluetooth.characteristic.glucose_measurement"),
    (0x2a19, "Battery Level", "org.bluetooth.characteristic.battery_level"),
    (0x2a1b, "Battery Level State", "org.bluetooth.characteristic.battery_level_state"),
    (0x2a1c, "Temperature Measurement", "org.bluetooth.characteristic.temperature_measurement"),
    (0x2a1d, "Temperature Type", "org.bluetooth.characteristic.temperature_type"),
    (0x2a22, "Boot Keyboard Input Report", "org.bluetooth.characteristic.boot_keyboard_input_report"),
    (0x2a23, "System ID", "org.bluetooth.characteristic.system_id"),
    (0x2a24, "Model Number String", "org.bluetooth.characteristic.model_number_string"),
    (0x2a25, "Serial Number String", "org.bluetooth.characteristic.serial_number_string"),
    (0x2a26, "Firmware Revision String", "org.bluetooth.characteristic.firmware_revision_string"),
    (0x2a27, "Hardware Revision String", "org.bluetooth.characteristic.hardware_revision_string"),
    (0x2a28, "Software Revision String", "org.bluetooth.characteristic.software_revision_string"),
    (0x2a29, "Manufacturer Name String", "org.bluetooth.characteristic.manufacturer_name_string"),
    (0x2a2b, "Current Time", "org.bluetooth.characteristic.current_time"),
    (0x2a35, "Blood Pressure Measurement", "org.bluetooth.characteristic.blood_pressure_measurement"),
    (0x2a36, "Intermediate Cuff Pressure", "org.bluetooth.characteristic.intermediate_cuff_pressure"),
    (0x2a37, "Heart Rate Measurement", "org.bluetooth.characteristic.heart_rate_measurement"),
    (0x2a38, "Body Sensor Location", "org.bluetooth.characteristic.body_sensor_location"),
    (0x2a39, "Heart Rate Control Point", "org.bluetooth.characteristic.heart_rate_control_point"),
    (0x2a4a, "HID Information", "org.bluetooth.characteristic.hid_information"),
    (0x2a4b, "Report Map", "org.bluetooth.characteristic.report_map"),
    (0x2a4c, "HID Control Point", "org.bluetooth.characteristic.hid_control_point"),
    (0x2a4d, "Report", "org.bluetooth.characteristic.report"),
    (0x2a4e, "Protocol Mode", "org.bluetooth.characteristic.protocol_mode"),
    (0x2a50, "PnP ID", "org.bluetooth.characteristic.pnp_id"),
    (0x2a53, "RSC Measurement", "org.bluetooth.characteristic.rsc_measurement"),
    (0x2a5b, "CSC Measurement", "org.bluetooth.characteristic.csc_measurement"),
    (0x2a5c, "CSC Feature", "org.bluetooth.characteristic.csc_feature"),
    (0x2a63, "Cycling Power Measurement", "org.bluetooth.characteristic.cycling_power_measurement"),
    (0x2a6c, "Elevation", "org.bluetooth.characteristic.elevation"),
    (0x2a6d, "Pressure", "org.bluetooth.characteristic.pressure"),
    (0x2a6e, "Temperature", "org.bluetooth.characteristic.temperature"),
    (0x2a6f, "Humidity", "org.bluetooth.characteristic.humidity"),
    (0x2a76, "UV Index", "org.bluetooth.characteristic.uv_index"),
    (0x2a79, "Wind Chill", "org.bluetooth.characteristic.wind_chill"),
    (0x2a98, "Weight", "org.bluetooth.characteristic.weight"),
    (0x2a9d, "Weight Measurement", "org.bluetooth.characteristic.weight_measurement"),
    (0x2a9e, "Weight Scale Feature", "org.bluetooth.characteristic.weight_scale_feature"),
    (0x2aa6, "Central Address Resolution", "org.bluetooth.characteristic.gap.central_address_resolution"),
    (0x2acc, "Fitness Machine Feature", "org.bluetooth.characteristic.fitness_machine_feature"),
    (0x2acd, "Treadmill Data", "org.bluetooth.characteristic.treadmill_data"),
    (0x2ad2, "Indoor Bike Data", "org.bluetooth.characteristic.indoor_bike_data"),
];
