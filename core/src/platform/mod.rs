//! Platform boundary for the radio stack
//!
//! The GATT core never talks to a concrete Bluetooth API. Everything it needs
//! from the OS radio stack goes through [`GattPlatform`]:
//! - object creation (service providers, characteristics, descriptors)
//! - event subscription with opaque revocation tokens
//! - request completion, value pushes, advertisement start/stop
//!
//! Platform code raises events by pushing [`PlatformEvent`]s into the
//! [`EventSink`] it was handed when subscribing. The sink is a plain channel
//! sender, so it may be called from any thread.

pub mod settings;
pub mod simulated;

pub use settings::{PeripheralSettings, SettingsError};
pub use simulated::{Notification, SimulatedPlatform};

use crate::gatt::model::AttErrorCode;
use crate::gatt::mapper::CharacteristicFlags;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Failures reported by the radio stack
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Unknown platform object: {0}")]
    UnknownObject(ObjectHandle),

    #[error("Unknown event token: {0}")]
    UnknownToken(EventToken),

    #[error("Unknown request: {0}")]
    UnknownRequest(RequestId),

    #[error("Radio unavailable: {0}")]
    RadioUnavailable(String),

    #[error("Platform rejected the operation: {0}")]
    Rejected(String),
}

// ============================================================================
// PLATFORM IDENTITIES
// ============================================================================

/// Identity of a platform object (service provider, characteristic or descriptor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHandle(pub u64);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Revocation token returned by [`GattPlatform::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventToken(pub u64);

impl fmt::Display for EventToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token#{}", self.0)
    }
}

/// Identity of an in-flight read/write request awaiting completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Opaque client identifier handed out by the radio stack
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientToken(pub String);

impl ClientToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// STATE ENUMS
// ============================================================================

/// Last known state of the local Bluetooth adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RadioState {
    /// No radio was found (or it has not reported yet)
    Unknown,
    On,
    Off,
    Disabled,
    Unauthorized,
}

impl RadioState {
    /// A radio exists, whatever its power state
    pub fn is_present(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::On => write!(f, "On"),
            Self::Off => write!(f, "Off"),
            Self::Disabled => write!(f, "Disabled"),
            Self::Unauthorized => write!(f, "Unauthorized"),
        }
    }
}

/// Advertisement status transitions reported per service provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdvertisementStatus {
    Created,
    Started,
    Stopped,
    Aborted,
    AdvertisementCancelled,
}

impl AdvertisementStatus {
    /// The stack gave up on the advertisement without being asked to
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Aborted | Self::AdvertisementCancelled)
    }

    /// No further transitions are expected for this advertisement
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Aborted | Self::AdvertisementCancelled
        )
    }
}

/// Event families a platform object can raise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ReadRequested,
    WriteRequested,
    SubscribedClientsChanged,
    AdvertisementStatusChanged,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadRequested => write!(f, "ReadRequested"),
            Self::WriteRequested => write!(f, "WriteRequested"),
            Self::SubscribedClientsChanged => write!(f, "SubscribedClientsChanged"),
            Self::AdvertisementStatusChanged => write!(f, "AdvertisementStatusChanged"),
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// The remote end of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub client: ClientToken,
    /// Whether the link to the central is encrypted
    pub encrypted: bool,
}

/// Already-decoded events raised by the radio stack
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    ReadRequested {
        source: ObjectHandle,
        request: RequestId,
        link: LinkInfo,
    },
    WriteRequested {
        source: ObjectHandle,
        /// `None` for write-without-response
        request: Option<RequestId>,
        link: LinkInfo,
        value: Vec<u8>,
    },
    SubscribedClientsChanged {
        source: ObjectHandle,
    },
    AdvertisementStatusChanged {
        source: ObjectHandle,
        status: AdvertisementStatus,
        error: Option<String>,
    },
    RadioStateChanged(RadioState),
}

impl PlatformEvent {
    /// Platform object that raised the event, if any
    pub fn source(&self) -> Option<ObjectHandle> {
        match self {
            Self::ReadRequested { source, .. }
            | Self::WriteRequested { source, .. }
            | Self::SubscribedClientsChanged { source }
            | Self::AdvertisementStatusChanged { source, .. } => Some(*source),
            Self::RadioStateChanged(_) => None,
        }
    }

    /// Request awaiting completion, if the event carries one
    pub fn request(&self) -> Option<RequestId> {
        match self {
            Self::ReadRequested { request, .. } => Some(*request),
            Self::WriteRequested { request, .. } => *request,
            _ => None,
        }
    }
}

/// Messages consumed by the dispatcher worker
#[derive(Debug)]
pub enum DispatchMessage {
    Platform(PlatformEvent),
    /// The listed objects were unregistered; their lanes can go
    Retire(Vec<ObjectHandle>),
    Shutdown,
}

/// Cloneable handle platform code uses to raise events
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<DispatchMessage>,
}

impl EventSink {
    /// Create a sink and the receiving half the dispatcher drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DispatchMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver an event; returns false once the dispatcher is gone
    pub fn deliver(&self, event: PlatformEvent) -> bool {
        self.tx.send(DispatchMessage::Platform(event)).is_ok()
    }

    pub(crate) fn retire(&self, handles: Vec<ObjectHandle>) -> bool {
        self.tx.send(DispatchMessage::Retire(handles)).is_ok()
    }

    pub(crate) fn shutdown(&self) -> bool {
        self.tx.send(DispatchMessage::Shutdown).is_ok()
    }
}

// ============================================================================
// CREATION PARAMETERS
// ============================================================================

/// Access protection applied by the stack to a read or write direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectionLevel {
    Plain,
    EncryptionRequired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicParameters {
    pub uuid: Uuid,
    pub properties: CharacteristicFlags,
    pub read_protection: ProtectionLevel,
    pub write_protection: ProtectionLevel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorParameters {
    pub uuid: Uuid,
    pub read_protection: ProtectionLevel,
    pub write_protection: ProtectionLevel,
}

/// Vendor-specific advertisement payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerData {
    pub manufacturer_id: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingParameters {
    pub connectable: bool,
    pub discoverable: bool,
    pub local_name: Option<String>,
    pub manufacturer_data: Option<ManufacturerData>,
    pub manufacturer_data_in_scan_response: bool,
}

/// Completion sent back for a read or write request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattResponse {
    Value(Vec<u8>),
    WriteAccepted,
    Error(AttErrorCode),
}

// ============================================================================
// PLATFORM TRAIT
// ============================================================================

/// Operations the GATT core needs from the OS radio stack
pub trait GattPlatform: Send + Sync {
    /// Current adapter state; `Unknown` when no radio exists
    fn radio_state(&self) -> RadioState;

    /// Deliver `RadioStateChanged` events into `sink` until revoked
    fn watch_radio(&self, sink: EventSink) -> Result<EventToken, PlatformError>;

    fn create_service_provider(&self, uuid: Uuid) -> Result<ObjectHandle, PlatformError>;

    fn create_characteristic(
        &self,
        service: ObjectHandle,
        params: &CharacteristicParameters,
    ) -> Result<ObjectHandle, PlatformError>;

    fn create_descriptor(
        &self,
        characteristic: ObjectHandle,
        params: &DescriptorParameters,
    ) -> Result<ObjectHandle, PlatformError>;

    /// Route `kind` events raised by `source` into `sink` until revoked
    fn subscribe(
        &self,
        source: ObjectHandle,
        kind: EventKind,
        sink: EventSink,
    ) -> Result<EventToken, PlatformError>;

    /// Revoke a subscription (event or radio watch)
    fn unsubscribe(&self, token: EventToken) -> Result<(), PlatformError>;

    /// Release a service provider and every object created under it
    fn release_service_provider(&self, service: ObjectHandle) -> Result<(), PlatformError>;

    /// Live view of clients subscribed to a characteristic
    fn subscribed_clients(&self, characteristic: ObjectHandle) -> Vec<ClientToken>;

    /// Push a value to one client, or to all subscribers when `client` is `None`.
    /// Returns the number of deliveries made.
    fn notify(
        &self,
        characteristic: ObjectHandle,
        value: &[u8],
        client: Option<&ClientToken>,
    ) -> Result<usize, PlatformError>;

    /// Complete an in-flight request
    fn respond(&self, request: RequestId, response: GattResponse) -> Result<(), PlatformError>;

    fn start_advertising(
        &self,
        service: ObjectHandle,
        params: &AdvertisingParameters,
    ) -> Result<(), PlatformError>;

    fn stop_advertising(&self, service: ObjectHandle) -> Result<(), PlatformError>;
}
