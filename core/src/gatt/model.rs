//! Application-level attribute model
//!
//! Services, characteristics and descriptors as the application hands them
//! over. Property and permission lists are the raw integer codes the
//! application layer uses; [`crate::gatt::mapper`] turns them into typed sets.

use crate::platform::ClientToken;
use crate::PeripheralError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Bluetooth base UUID, onto which 16- and 32-bit short forms expand
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

// ============================================================================
// ATT STATUS CODES
// ============================================================================

/// Protocol status codes used to complete rejected requests
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AttErrorCode {
    #[error("invalid handle")]
    InvalidHandle = 0x01,
    #[error("read not permitted")]
    ReadNotPermitted = 0x02,
    #[error("write not permitted")]
    WriteNotPermitted = 0x03,
    #[error("insufficient authentication")]
    InsufficientAuthentication = 0x05,
    #[error("request not supported")]
    RequestNotSupported = 0x06,
    #[error("invalid offset")]
    InvalidOffset = 0x07,
    #[error("insufficient authorization")]
    InsufficientAuthorization = 0x08,
    #[error("invalid attribute value length")]
    InvalidAttributeValueLength = 0x0D,
    #[error("unlikely error")]
    UnlikelyError = 0x0E,
    #[error("insufficient encryption")]
    InsufficientEncryption = 0x0F,
}

impl AttErrorCode {
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

// ============================================================================
// APPLICATION MODEL
// ============================================================================

/// A GATT service definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleService {
    pub uuid: String,
    /// Primary services are the ones announced when advertising without an
    /// explicit service list
    #[serde(default = "default_primary")]
    pub primary: bool,
    #[serde(default)]
    pub characteristics: Vec<BleCharacteristic>,
}

fn default_primary() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleCharacteristic {
    pub uuid: String,
    /// Property codes, see [`crate::gatt::mapper::CharacteristicProperty`]
    #[serde(default)]
    pub properties: Vec<i64>,
    /// Permission codes, see [`crate::gatt::mapper::BlePermission`]
    #[serde(default)]
    pub permissions: Vec<i64>,
    #[serde(default)]
    pub descriptors: Vec<BleDescriptor>,
    #[serde(default)]
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleDescriptor {
    pub uuid: String,
    #[serde(default)]
    pub value: Option<Vec<u8>>,
    #[serde(default)]
    pub permissions: Vec<i64>,
}

/// A central subscribed to notifications/indications of a characteristic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscribedClient {
    pub token: ClientToken,
    /// Remote address parsed out of the token
    pub device_id: String,
}

impl SubscribedClient {
    pub fn from_token(token: ClientToken) -> Self {
        let device_id = crate::gatt::mapper::parse_client_id(token.as_str());
        Self { token, device_id }
    }
}

impl fmt::Display for SubscribedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.device_id)
    }
}

/// Outcome of recomputing a characteristic's subscriber set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub characteristic_id: String,
    pub clients: Vec<SubscribedClient>,
    pub added: Vec<SubscribedClient>,
    pub removed: Vec<SubscribedClient>,
}

// ============================================================================
// UUID HANDLING
// ============================================================================

/// Parse an attribute id, expanding 16/32-bit short forms onto the base UUID
pub fn parse_uuid(id: &str) -> Result<Uuid, PeripheralError> {
    let trimmed = id.trim();
    let short = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if (short.len() == 4 || short.len() == 8) && short.chars().all(|c| c.is_ascii_hexdigit()) {
        let value = u32::from_str_radix(short, 16)
            .map_err(|_| PeripheralError::InvalidArgument(format!("invalid uuid: {id}")))?;
        return Ok(Uuid::from_u128(BLUETOOTH_BASE_UUID | ((value as u128) << 96)));
    }

    Uuid::parse_str(trimmed)
        .map_err(|_| PeripheralError::InvalidArgument(format!("invalid uuid: {id}")))
}
