//! Deterministic in-process radio backends
//!
//! [`EmulatedCentral`] and [`EmulatedPeripheralRadio`] stand in for a platform Bluetooth stack. They answer requests
//! from a scripted set of devices, record every request they receive and let tests drive unsolicited radio activity
//! (power changes, disconnections, notifications, remote requests).
//!
//! Both start from a configuration modelled on a freshly installed application: authorization not determined, radio
//! state unknown. Requesting authorization moves them to a granted or denied state depending on the configured
//! [`AuthorizationBehavior`].

use std::time::Duration;

use crate::{ManagerAuthorization, ManagerState};

mod central;
mod device;
mod server;

pub use central::{EmulatedCentral, RadioCall};
pub use device::{EmulatedCharacteristic, EmulatedDescriptor, EmulatedPeripheral, EmulatedService};
pub use server::{AttResponse, EmulatedPeripheralRadio, ValueUpdate};

/// What happens when an emulated manager is asked for authorization
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(rename_all = "camelCase"))]
pub enum AuthorizationBehavior {
    /// Authorization becomes [`ManagerAuthorization::AllowedAlways`] and the radio [`ManagerState::PoweredOn`]
    Success,
    /// Authorization becomes [`ManagerAuthorization::Denied`] and the radio [`ManagerState::Unauthorized`]
    #[default]
    Failure,
}

/// Initial state of an emulated manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "camelCase", default)
)]
pub struct EmulatedManagerConfig {
    #[allow(missing_docs)]
    pub authorization: ManagerAuthorization,
    /// Outcome of an authorization request
    pub authorization_behavior: AuthorizationBehavior,
    #[allow(missing_docs)]
    pub state: ManagerState,
}

/// Initial state of an [`EmulatedCentral`]
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "camelCase", default)
)]
pub struct EmulatedCentralConfig {
    #[allow(missing_docs)]
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub manager: EmulatedManagerConfig,
    /// Seconds between two peripherals reported by a scan. Zero reports them all at once.
    pub scan_emit_rate: f64,
}

impl Default for EmulatedCentralConfig {
    fn default() -> Self {
        EmulatedCentralConfig {
            manager: EmulatedManagerConfig::default(),
            scan_emit_rate: 2.0,
        }
    }
}

impl EmulatedManagerConfig {
    /// The environment variable read by [`EmulatedManagerConfig::from_env`]
    pub const ENVIRONMENT_KEY: &'static str = "BLUETOOTH_MANAGER_CONFIGURATION";

    /// Reads the configuration from the JSON held in [`Self::ENVIRONMENT_KEY`], falling back to the default if the
    /// variable is not set.
    #[cfg(feature = "serde")]
    pub fn from_env() -> crate::Result<Self> {
        load(Self::ENVIRONMENT_KEY)
    }
}

impl EmulatedCentralConfig {
    /// The environment variable read by [`EmulatedCentralConfig::from_env`]
    pub const ENVIRONMENT_KEY: &'static str = "BLUETOOTH_CENTRAL_MANAGER_CONFIGURATION";

    /// Reads the configuration from the JSON held in [`Self::ENVIRONMENT_KEY`], falling back to the default if the
    /// variable is not set.
    #[cfg(feature = "serde")]
    pub fn from_env() -> crate::Result<Self> {
        load(Self::ENVIRONMENT_KEY)
    }

    /// Creates a configuration that reports scan results immediately.
    pub fn immediate(manager: EmulatedManagerConfig) -> Self {
        EmulatedCentralConfig {
            manager,
            scan_emit_rate: 0.0,
        }
    }

    /// The scan emit rate as a duration. Negative or non-finite rates count as zero.
    pub fn scan_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.scan_emit_rate).unwrap_or(Duration::ZERO)
    }
}

#[cfg(feature = "serde")]
fn load<T: serde::de::DeserializeOwned + Default>(key: &str) -> crate::Result<T> {
    use crate::error::ErrorKind;
    use crate::Error;

    match std::env::var(key) {
        Ok(json) => serde_json::from_str(&json).map_err(|err| {
            Error::new(
                ErrorKind::Undefined,
                Some(std::sync::Arc::new(err)),
                format!("malformed {key}"),
            )
        }),
        Err(_) => Ok(T::default()),
    }
}

/// The manager half shared by both emulated radios.
#[derive(Debug)]
pub(crate) struct ManagerEmulation {
    pub state: ManagerState,
    pub authorization: ManagerAuthorization,
    behavior: AuthorizationBehavior,
}

impl ManagerEmulation {
    pub fn new(config: &EmulatedManagerConfig) -> Self {
        ManagerEmulation {
            state: config.state,
            authorization: config.authorization,
            behavior: config.authorization_behavior,
        }
    }

    /// Answers an authorization request. Returns the new authorization and state, or `None` if the radio already
    /// holds the outcome the configured behavior produces.
    pub fn request_authorization(&mut self) -> Option<(ManagerAuthorization, ManagerState)> {
        let (authorization, state) = match self.behavior {
            AuthorizationBehavior::Success => (ManagerAuthorization::AllowedAlways, ManagerState::PoweredOn),
            AuthorizationBehavior::Failure => (ManagerAuthorization::Denied, ManagerState::Unauthorized),
        };
        if self.authorization == authorization {
            return None;
        }
        self.authorization = authorization;
        self.state = state;
        Some((authorization, state))
    }
}
