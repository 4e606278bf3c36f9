//! GATT server role
//!
//! - `model` / `mapper`: application attribute model and code translations
//! - `registry`: live services and the indices used to resolve events
//! - `dispatcher`: event subscription and per-attribute routing
//! - `server`: read/write/subscription protocol logic
//! - `advertising`: advertising session state
//! - `request`: exactly-once request completion

pub mod advertising;
pub mod dispatcher;
pub mod mapper;
pub mod model;
pub mod registry;
pub mod request;
pub mod server;

pub use advertising::{AdvertisingController, AdvertisingRequest};
pub use dispatcher::{EventDispatcher, EventSubscriber};
pub use mapper::{
    advertisement_status_to_text, parse_client_id, to_characteristic_properties, to_permission,
    to_permission_set, AccessLevel, BlePermission, CharacteristicFlags, CharacteristicProperty,
    PermissionSet,
};
pub use model::{AttErrorCode, BleCharacteristic, BleDescriptor, BleService};
pub use registry::{ResolvedAttribute, ServiceRegistry};
pub use server::GattServerCore;
