// BLE Peripheral Core — GATT server role
//
// Publishes services, answers read/write requests from remote centrals,
// tracks subscriptions and drives the advertisement lifecycle. The radio
// itself sits behind `platform::GattPlatform`.

pub mod gatt;
pub mod peripheral;
pub mod platform;

use thiserror::Error;

pub use gatt::advertising::AdvertisingRequest;
pub use gatt::model::{
    parse_uuid, AttErrorCode, BleCharacteristic, BleDescriptor, BleService, SubscribedClient,
    SubscriptionChange,
};
pub use peripheral::{BlePeripheral, NoopCallbacks, PeripheralCallbacks};
pub use platform::{
    AdvertisementStatus, GattPlatform, ManufacturerData, PeripheralSettings, PlatformError,
    RadioState, SimulatedPlatform,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeripheralError {
    #[error("Bluetooth not supported: {0}")]
    NotSupported(String),

    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Already advertising")]
    AlreadyAdvertising,

    #[error("Access denied: {0}")]
    AccessDenied(AttErrorCode),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Cleanup failed for {} entries", .failures.len())]
    Cleanup {
        failures: Vec<(String, PeripheralError)>,
    },
}

impl From<AttErrorCode> for PeripheralError {
    fn from(code: AttErrorCode) -> Self {
        PeripheralError::AccessDenied(code)
    }
}

// ============================================================================
// LOGGING
// ============================================================================

/// Install the global `tracing` subscriber (idempotent).
///
/// `RUST_LOG` wins over `default_filter` when set.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_error_lists_failures() {
        let err = PeripheralError::Cleanup {
            failures: vec![
                (
                    "180d".to_string(),
                    PeripheralError::Platform(PlatformError::Rejected("busy".to_string())),
                ),
                ("180f".to_string(), PeripheralError::NotFound("x".to_string())),
            ],
        };
        assert_eq!(err.to_string(), "Cleanup failed for 2 entries");
    }

    #[test]
    fn test_att_code_converts_to_access_denied() {
        let err: PeripheralError = AttErrorCode::InsufficientAuthentication.into();
        assert_eq!(
            err,
            PeripheralError::AccessDenied(AttErrorCode::InsufficientAuthentication)
        );
        assert_eq!(err.to_string(), "Access denied: insufficient authentication");
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing("debug");
        init_tracing("info");
    }
}
