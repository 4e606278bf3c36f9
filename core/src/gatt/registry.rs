//! Service registry
//!
//! Owns the live set of published services and the indices used to resolve
//! platform events:
//! - service id -> service entry (plus registration order)
//! - characteristic id -> characteristic entry (flattened, O(1))
//! - platform object -> attribute, for reverse-mapping event sources
//!
//! Structure is guarded by a single `RwLock`; construction happens under the
//! write lock so readers never observe a half-built service. Attribute values
//! and subscriber sets carry their own mutexes.
//!
//! Every platform subscription made for a service is recorded on its entry.
//! Removal revokes those tokens before the provider is released, and only
//! then erases the entry.

use super::dispatcher::{
    EventSubscriber, CHARACTERISTIC_EVENTS, DESCRIPTOR_EVENTS, SERVICE_EVENTS,
};
use super::mapper::{to_characteristic_properties, to_permission_set, CharacteristicFlags, PermissionSet};
use super::model::{parse_uuid, BleCharacteristic, BleDescriptor, BleService, SubscribedClient};
use crate::platform::{
    CharacteristicParameters, DescriptorParameters, EventToken, GattPlatform, ObjectHandle,
    PlatformError,
};
use crate::PeripheralError;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// ENTRIES
// ============================================================================

#[derive(Debug)]
pub struct DescriptorEntry {
    pub id: String,
    pub uuid: Uuid,
    pub handle: ObjectHandle,
    pub permissions: PermissionSet,
    pub permission_codes: Vec<i64>,
    value: Mutex<Vec<u8>>,
}

impl DescriptorEntry {
    pub fn value(&self) -> Vec<u8> {
        self.value.lock().clone()
    }

    pub fn set_value(&self, value: Vec<u8>) -> Vec<u8> {
        std::mem::replace(&mut *self.value.lock(), value)
    }

    /// Put `previous` back, unless someone replaced `written` in the meantime
    pub fn restore_value(&self, written: &[u8], previous: Vec<u8>) {
        let mut value = self.value.lock();
        if value.as_slice() == written {
            *value = previous;
        }
    }

    fn to_model(&self) -> BleDescriptor {
        BleDescriptor {
            uuid: self.id.clone(),
            value: Some(self.value()),
            permissions: self.permission_codes.clone(),
        }
    }
}

#[derive(Debug)]
pub struct CharacteristicEntry {
    pub id: String,
    pub uuid: Uuid,
    pub handle: ObjectHandle,
    pub service_id: String,
    pub properties: CharacteristicFlags,
    pub property_codes: Vec<i64>,
    pub permissions: PermissionSet,
    pub permission_codes: Vec<i64>,
    pub descriptors: Vec<Arc<DescriptorEntry>>,
    value: Mutex<Vec<u8>>,
    subscribers: Mutex<Vec<SubscribedClient>>,
}

impl CharacteristicEntry {
    pub fn value(&self) -> Vec<u8> {
        self.value.lock().clone()
    }

    /// Store a new value and return the one it replaced
    pub fn set_value(&self, value: Vec<u8>) -> Vec<u8> {
        std::mem::replace(&mut *self.value.lock(), value)
    }

    /// Put `previous` back, unless someone replaced `written` in the meantime
    pub fn restore_value(&self, written: &[u8], previous: Vec<u8>) {
        let mut value = self.value.lock();
        if value.as_slice() == written {
            *value = previous;
        }
    }

    /// Replace the subscriber set and return the previous one
    pub fn replace_subscribers(&self, clients: Vec<SubscribedClient>) -> Vec<SubscribedClient> {
        std::mem::replace(&mut *self.subscribers.lock(), clients)
    }

    fn to_model(&self) -> BleCharacteristic {
        BleCharacteristic {
            uuid: self.id.clone(),
            properties: self.property_codes.clone(),
            permissions: self.permission_codes.clone(),
            descriptors: self.descriptors.iter().map(|d| d.to_model()).collect(),
            value: Some(self.value()),
        }
    }
}

#[derive(Debug)]
pub struct ServiceEntry {
    pub id: String,
    pub uuid: Uuid,
    pub primary: bool,
    pub handle: ObjectHandle,
    pub characteristics: Vec<Arc<CharacteristicEntry>>,
    /// Ownership record of every subscription made for this service
    tokens: Vec<EventToken>,
}

impl ServiceEntry {
    pub fn tokens(&self) -> &[EventToken] {
        &self.tokens
    }

    /// Every platform object belonging to this service
    pub fn handles(&self) -> Vec<ObjectHandle> {
        let mut handles = vec![self.handle];
        for characteristic in &self.characteristics {
            handles.push(characteristic.handle);
            handles.extend(characteristic.descriptors.iter().map(|d| d.handle));
        }
        handles
    }

    fn to_model(&self) -> BleService {
        BleService {
            uuid: self.id.clone(),
            primary: self.primary,
            characteristics: self.characteristics.iter().map(|c| c.to_model()).collect(),
        }
    }
}

/// What a platform object resolves to
#[derive(Debug, Clone)]
pub enum ResolvedAttribute {
    Service(Arc<ServiceEntry>),
    Characteristic(Arc<CharacteristicEntry>),
    Descriptor(Arc<CharacteristicEntry>, Arc<DescriptorEntry>),
}

// ============================================================================
// REGISTRY
// ============================================================================

#[derive(Default)]
struct RegistryInner {
    services: HashMap<String, Arc<ServiceEntry>>,
    order: Vec<String>,
    characteristics: HashMap<String, Arc<CharacteristicEntry>>,
    handles: HashMap<ObjectHandle, ResolvedAttribute>,
}

impl RegistryInner {
    fn insert(&mut self, entry: Arc<ServiceEntry>) {
        self.handles
            .insert(entry.handle, ResolvedAttribute::Service(entry.clone()));
        for characteristic in &entry.characteristics {
            self.characteristics
                .insert(characteristic.id.clone(), characteristic.clone());
            self.handles.insert(
                characteristic.handle,
                ResolvedAttribute::Characteristic(characteristic.clone()),
            );
            for descriptor in &characteristic.descriptors {
                self.handles.insert(
                    descriptor.handle,
                    ResolvedAttribute::Descriptor(characteristic.clone(), descriptor.clone()),
                );
            }
        }
        self.order.push(entry.id.clone());
        self.services.insert(entry.id.clone(), entry);
    }

    fn erase(&mut self, entry: &ServiceEntry) {
        for handle in entry.handles() {
            self.handles.remove(&handle);
        }
        for characteristic in &entry.characteristics {
            self.characteristics.remove(&characteristic.id);
        }
        self.order.retain(|id| id != &entry.id);
        self.services.remove(&entry.id);
    }
}

/// Platform objects and tokens issued while building a service
#[derive(Default)]
struct Construction {
    provider: Option<ObjectHandle>,
    tokens: Vec<EventToken>,
}

pub struct ServiceRegistry {
    platform: Arc<dyn GattPlatform>,
    subscriber: EventSubscriber,
    inner: RwLock<RegistryInner>,
}

impl ServiceRegistry {
    pub fn new(platform: Arc<dyn GattPlatform>, subscriber: EventSubscriber) -> Self {
        Self {
            platform,
            subscriber,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Publish a service with all of its characteristics and descriptors
    pub fn add_service(&self, service: &BleService) -> Result<Arc<ServiceEntry>, PeripheralError> {
        let uuid = parse_uuid(&service.uuid)?;
        let id = uuid.to_string();
        let characteristic_ids = validate_definition(service)?;

        let mut inner = self.inner.write();
        if inner.services.contains_key(&id) {
            return Err(PeripheralError::AlreadyExists(format!("service {id}")));
        }
        if let Some(taken) = characteristic_ids
            .iter()
            .find(|c| inner.characteristics.contains_key(c.as_str()))
        {
            return Err(PeripheralError::AlreadyExists(format!(
                "characteristic {taken}"
            )));
        }

        let mut construction = Construction::default();
        match self.build(uuid, service, &mut construction) {
            Ok(entry) => {
                let entry = Arc::new(entry);
                inner.insert(entry.clone());
                info!(
                    "Added service {} ({} characteristics, {} subscriptions)",
                    id,
                    entry.characteristics.len(),
                    entry.tokens.len()
                );
                Ok(entry)
            }
            Err(e) => {
                warn!("Building service {} failed: {}; rolling back", id, e);
                self.subscriber.revoke(&construction.tokens);
                if let Some(provider) = construction.provider {
                    if let Err(release) = self.platform.release_service_provider(provider) {
                        warn!("Rollback release of {} failed: {}", provider, release);
                    }
                }
                Err(e.into())
            }
        }
    }

    fn build(
        &self,
        uuid: Uuid,
        service: &BleService,
        construction: &mut Construction,
    ) -> Result<ServiceEntry, PlatformError> {
        let id = uuid.to_string();
        let provider = self.platform.create_service_provider(uuid)?;
        construction.provider = Some(provider);

        let mut characteristics = Vec::with_capacity(service.characteristics.len());
        for definition in &service.characteristics {
            let characteristic = self.build_characteristic(&id, provider, definition, construction)?;
            characteristics.push(Arc::new(characteristic));
        }

        self.subscriber
            .subscribe(provider, &SERVICE_EVENTS, &mut construction.tokens)?;

        Ok(ServiceEntry {
            id,
            uuid,
            primary: service.primary,
            handle: provider,
            characteristics,
            tokens: std::mem::take(&mut construction.tokens),
        })
    }

    fn build_characteristic(
        &self,
        service_id: &str,
        provider: ObjectHandle,
        definition: &BleCharacteristic,
        construction: &mut Construction,
    ) -> Result<CharacteristicEntry, PlatformError> {
        // Validated before the write lock was taken
        let uuid = parse_uuid(&definition.uuid)
            .map_err(|e| PlatformError::Rejected(e.to_string()))?;
        let properties = to_characteristic_properties(&definition.properties);
        let permissions = to_permission_set(&definition.permissions);

        let handle = self.platform.create_characteristic(
            provider,
            &CharacteristicParameters {
                uuid,
                properties,
                read_protection: permissions.read.protection(),
                write_protection: permissions.write.protection(),
            },
        )?;

        let mut descriptors = Vec::with_capacity(definition.descriptors.len());
        for descriptor in &definition.descriptors {
            let descriptor_uuid = parse_uuid(&descriptor.uuid)
                .map_err(|e| PlatformError::Rejected(e.to_string()))?;
            let descriptor_permissions = to_permission_set(&descriptor.permissions);
            let descriptor_handle = self.platform.create_descriptor(
                handle,
                &DescriptorParameters {
                    uuid: descriptor_uuid,
                    read_protection: descriptor_permissions.read.protection(),
                    write_protection: descriptor_permissions.write.protection(),
                },
            )?;
            self.subscriber.subscribe(
                descriptor_handle,
                &DESCRIPTOR_EVENTS,
                &mut construction.tokens,
            )?;
            descriptors.push(Arc::new(DescriptorEntry {
                id: descriptor_uuid.to_string(),
                uuid: descriptor_uuid,
                handle: descriptor_handle,
                permissions: descriptor_permissions,
                permission_codes: descriptor.permissions.clone(),
                value: Mutex::new(descriptor.value.clone().unwrap_or_default()),
            }));
        }

        self.subscriber
            .subscribe(handle, &CHARACTERISTIC_EVENTS, &mut construction.tokens)?;

        debug!(
            "Built characteristic {} ({:#06x}) with {} descriptors",
            uuid,
            properties.bits(),
            descriptors.len()
        );

        Ok(CharacteristicEntry {
            id: uuid.to_string(),
            uuid,
            handle,
            service_id: service_id.to_string(),
            properties,
            property_codes: definition.properties.clone(),
            permissions,
            permission_codes: definition.permissions.clone(),
            descriptors,
            value: Mutex::new(definition.value.clone().unwrap_or_default()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Unpublish a service: revoke its subscriptions, release the provider,
    /// erase the entry. The entry is erased even when a platform step fails;
    /// the first failure is returned.
    pub fn remove_service(&self, id: &str) -> Result<(), PeripheralError> {
        let key = parse_uuid(id)?.to_string();
        let mut inner = self.inner.write();
        let entry = inner
            .services
            .get(&key)
            .cloned()
            .ok_or_else(|| PeripheralError::NotFound(format!("service {key}")))?;

        let revoke_failures = self.subscriber.revoke(&entry.tokens);
        self.subscriber.retire(entry.handles());
        let released = self.platform.release_service_provider(entry.handle);
        inner.erase(&entry);
        drop(inner);

        if let Err(e) = released {
            warn!("Releasing service {} failed: {}", key, e);
            return Err(e.into());
        }
        if let Some((_, e)) = revoke_failures.into_iter().next() {
            return Err(e.into());
        }
        info!("Removed service {}", key);
        Ok(())
    }

    /// Remove every service, continuing past failures
    pub fn clear_services(&self) -> Result<(), PeripheralError> {
        let ids = self.inner.read().order.clone();
        let mut failures = Vec::new();
        for id in ids {
            match self.remove_service(&id) {
                Ok(()) => {}
                // Raced with a concurrent removal
                Err(PeripheralError::NotFound(_)) => {}
                Err(e) => failures.push((id, e)),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(PeripheralError::Cleanup { failures })
        }
    }

    /// Drop everything: revoke all subscriptions of all services first, then
    /// release every provider
    pub fn teardown(&self) -> Result<(), PeripheralError> {
        let mut inner = self.inner.write();
        let entries: Vec<Arc<ServiceEntry>> = inner
            .order
            .iter()
            .filter_map(|id| inner.services.get(id).cloned())
            .collect();
        if entries.is_empty() {
            return Ok(());
        }

        let mut failures = Vec::new();
        for entry in &entries {
            if let Some((_, e)) = self.subscriber.revoke(&entry.tokens).into_iter().next() {
                failures.push((entry.id.clone(), PeripheralError::from(e)));
            }
            self.subscriber.retire(entry.handles());
        }
        for entry in &entries {
            if let Err(e) = self.platform.release_service_provider(entry.handle) {
                warn!("Releasing service {} failed: {}", entry.id, e);
                failures.push((entry.id.clone(), e.into()));
            }
            inner.erase(entry);
        }
        info!("Registry torn down ({} services)", entries.len());

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PeripheralError::Cleanup { failures })
        }
    }

    /// Application view of every live service, in registration order
    pub fn get_services(&self) -> Vec<BleService> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.services.get(id))
            .map(|entry| entry.to_model())
            .collect()
    }

    pub fn find_service(&self, id: &str) -> Option<Arc<ServiceEntry>> {
        let key = parse_uuid(id).ok()?.to_string();
        self.inner.read().services.get(&key).cloned()
    }

    pub fn find_characteristic(&self, id: &str) -> Option<Arc<CharacteristicEntry>> {
        let key = parse_uuid(id).ok()?.to_string();
        self.inner.read().characteristics.get(&key).cloned()
    }

    /// Reverse-map a platform object to the attribute it backs
    pub fn resolve(&self, handle: ObjectHandle) -> Option<ResolvedAttribute> {
        self.inner.read().handles.get(&handle).cloned()
    }

    pub fn is_live(&self, handle: ObjectHandle) -> bool {
        self.inner.read().handles.contains_key(&handle)
    }

    /// Providers to advertise for `ids`; an empty list selects every primary service
    pub fn advertisable(&self, ids: &[String]) -> Result<Vec<(String, ObjectHandle)>, PeripheralError> {
        let inner = self.inner.read();
        let targets: Vec<(String, ObjectHandle)> = if ids.is_empty() {
            inner
                .order
                .iter()
                .filter_map(|id| inner.services.get(id))
                .filter(|entry| entry.primary)
                .map(|entry| (entry.id.clone(), entry.handle))
                .collect()
        } else {
            let mut targets = Vec::with_capacity(ids.len());
            for id in ids {
                let key = parse_uuid(id)?.to_string();
                let entry = inner
                    .services
                    .get(&key)
                    .ok_or_else(|| PeripheralError::NotFound(format!("service {key}")))?;
                if !targets.iter().any(|(existing, _)| existing == &key) {
                    targets.push((key, entry.handle));
                }
            }
            targets
        };

        if targets.is_empty() {
            return Err(PeripheralError::InvalidState(
                "no services to advertise".to_string(),
            ));
        }
        Ok(targets)
    }

    pub fn len(&self) -> usize {
        self.inner.read().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Check a definition before touching the platform: every uuid parses,
/// characteristic ids are unique within the service and descriptor ids
/// within their characteristic. Returns the canonical characteristic ids.
fn validate_definition(service: &BleService) -> Result<Vec<String>, PeripheralError> {
    let mut characteristic_ids = Vec::with_capacity(service.characteristics.len());
    let mut seen = HashSet::new();
    for characteristic in &service.characteristics {
        let id = parse_uuid(&characteristic.uuid)?.to_string();
        if !seen.insert(id.clone()) {
            return Err(PeripheralError::InvalidArgument(format!(
                "characteristic {id} appears twice in service {}",
                service.uuid
            )));
        }

        let mut descriptor_ids = HashSet::new();
        for descriptor in &characteristic.descriptors {
            let descriptor_id = parse_uuid(&descriptor.uuid)?;
            if !descriptor_ids.insert(descriptor_id) {
                return Err(PeripheralError::InvalidArgument(format!(
                    "descriptor {descriptor_id} appears twice in characteristic {id}"
                )));
            }
        }
        characteristic_ids.push(id);
    }
    Ok(characteristic_ids)
}
