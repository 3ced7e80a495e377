//! Blueshift errors

use std::sync::Arc;

use num_enum::TryFromPrimitive;

use crate::BluetoothId;

/// An error reported by a radio backend
pub type BackendError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// The error type for Bluetooth operations
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    source: Option<BackendError>,
    message: String,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, source: Option<BackendError>, message: impl Into<String>) -> Self {
        Error {
            kind,
            source,
            message: message.into(),
        }
    }

    /// Wraps a failure reported by a backend.
    ///
    /// If the backend reported one of this crate's errors its kind is kept, otherwise the failure becomes an
    /// [`ErrorKind::Undefined`] error with the backend failure as its source.
    pub fn from_backend(cause: BackendError) -> Self {
        match cause.downcast_ref::<Error>() {
            Some(err) => err.clone(),
            None => Error::new(ErrorKind::Undefined, Some(cause), String::new()),
        }
    }

    /// Returns the corresponding [ErrorKind] for this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the message for this error.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` if this error means the link to the peripheral has ended.
    ///
    /// Only [`ErrorKind::NotConnected`] is classified this way.
    pub fn is_connection_ended(&self) -> bool {
        self.kind == ErrorKind::NotConnected
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.message.is_empty(), &self.source) {
            (true, None) => write!(f, "{}", &self.kind),
            (false, None) => write!(f, "{}: {}", &self.kind, &self.message),
            (true, Some(err)) => write!(f, "{}: {}", &self.kind, err),
            (false, Some(err)) => write!(f, "{}: {} ({})", &self.kind, &self.message, err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|x| {
            let x: &(dyn std::error::Error + 'static) = &**x;
            x
        })
    }
}

/// The closed set of failures reported by managers and entities.
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// the Bluetooth manager is in an unknown state
    UnknownState,
    /// Bluetooth is not powered on
    NotPoweredOn,
    /// the Bluetooth operation is unsupported
    NotSupported,
    /// Bluetooth use is not authorized
    NotAuthorized,
    /// timed out
    TimeoutExpired,
    /// the peripheral is not connected
    NotConnected,
    /// service {0} not found
    ServiceNotFound(BluetoothId),
    /// service {0} has been invalidated
    ServiceInvalidated(BluetoothId),
    /// characteristic {0} not found
    CharacteristicNotFound(BluetoothId),
    /// characteristic {0} has been invalidated
    CharacteristicInvalidated(BluetoothId),
    /// the characteristic cannot be read
    CharacteristicReadNotAvailable,
    /// the characteristic cannot be written
    CharacteristicWriteNotAvailable,
    /// undefined error
    Undefined,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            kind,
            source: None,
            message: String::new(),
        }
    }
}

/// Bluetooth Attribute Protocol error codes. See the Bluetooth Core Specification, Vol 3, Part F, §3.4.1.1
#[repr(u8)]
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive)]
pub enum AttErrorCode {
    /// The operation completed successfully.
    Success = 0x00,
    /// The attribute handle given was not valid on this server.
    InvalidHandle = 0x01,
    /// The attribute cannot be read.
    ReadNotPermitted = 0x02,
    /// The attribute cannot be written.
    WriteNotPermitted = 0x03,
    /// The attribute PDU was invalid.
    InvalidPdu = 0x04,
    /// The attribute requires authentication before it can be read or written.
    InsufficientAuthentication = 0x05,
    /// Attribute server does not support the request received from the client.
    RequestNotSupported = 0x06,
    /// Offset specified was past the end of the attribute.
    InvalidOffset = 0x07,
    /// The attribute requires authorization before it can be read or written.
    InsufficientAuthorization = 0x08,
    /// Too many prepare writes have been queued.
    PrepareQueueFull = 0x09,
    /// No attribute found within the given attribute handle range.
    AttributeNotFound = 0x0a,
    /// The attribute cannot be read or written using the Read Blob Request.
    AttributeNotLong = 0x0b,
    /// The Encryption Key Size used for encrypting this link is insufficient.
    InsufficientEncryptionKeySize = 0x0c,
    /// The attribute value length is invalid for the operation.
    InvalidAttributeValueLength = 0x0d,
    /// The attribute request that was requested has encountered an error that was unlikely.
    UnlikelyError = 0x0e,
    /// The attribute requires encryption before it can be read or written.
    InsufficientEncryption = 0x0f,
    /// The attribute type is not a supported grouping attribute as defined by a higher layer specification.
    UnsupportedGroupType = 0x10,
    /// Insufficient Resources to complete the request.
    InsufficientResources = 0x11,
}

/// Bluetooth Attribute Protocol result sent in answer to a remote request.
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttError {
    /// {0}
    Known(AttErrorCode),
    /// application specific error: {0}
    Application(u8),
    /// unknown error: {0}
    Reserved(u8),
}

impl AttError {
    /// Returns `true` for [`AttErrorCode::Success`].
    pub fn is_success(&self) -> bool {
        *self == AttError::Known(AttErrorCode::Success)
    }
}

impl From<AttErrorCode> for AttError {
    fn from(code: AttErrorCode) -> Self {
        AttError::Known(code)
    }
}

impl From<u8> for AttError {
    fn from(number: u8) -> Self {
        match AttErrorCode::try_from(number) {
            Ok(code) => AttError::Known(code),
            Err(_) => {
                if (0x80..0xa0).contains(&number) {
                    AttError::Application(number)
                } else {
                    AttError::Reserved(number)
                }
            }
        }
    }
}

impl From<AttError> for u8 {
    fn from(err: AttError) -> Self {
        match err {
            AttError::Known(code) => code as u8,
            AttError::Application(x) | AttError::Reserved(x) => x,
        }
    }
}
