//! GATT server protocol logic
//!
//! Runs on the dispatcher's attribute lanes. Every read and every write that
//! expects a response is wrapped in a [`PendingRequest`] on entry, so each
//! path either answers explicitly or lets the guard answer `UnlikelyError`.

use super::advertising::{AdvertisingController, StatusOutcome};
use super::mapper::{parse_client_id, AccessLevel, CharacteristicFlags};
use super::model::{AttErrorCode, SubscribedClient, SubscriptionChange};
use super::registry::{CharacteristicEntry, DescriptorEntry, ResolvedAttribute, ServiceEntry};
use super::request::PendingRequest;
use crate::peripheral::PeripheralCallbacks;
use crate::platform::{
    AdvertisementStatus, GattPlatform, GattResponse, LinkInfo, PlatformEvent, RadioState,
    RequestId,
};
use crate::PeripheralError;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Check one access direction against the link.
///
/// Encryption-required over a plain link is an authentication failure; a
/// denied direction fails with `denied`.
pub fn check_access(level: AccessLevel, encrypted: bool, denied: AttErrorCode) -> Result<(), AttErrorCode> {
    match level {
        AccessLevel::Denied => Err(denied),
        AccessLevel::EncryptionRequired if !encrypted => {
            Err(AttErrorCode::InsufficientAuthentication)
        }
        AccessLevel::Open | AccessLevel::EncryptionRequired => Ok(()),
    }
}

/// Diff two subscriber sets by token
fn diff_subscribers(
    previous: &[SubscribedClient],
    current: &[SubscribedClient],
) -> (Vec<SubscribedClient>, Vec<SubscribedClient>) {
    let added = current
        .iter()
        .filter(|c| !previous.iter().any(|p| p.token == c.token))
        .cloned()
        .collect();
    let removed = previous
        .iter()
        .filter(|p| !current.iter().any(|c| c.token == p.token))
        .cloned()
        .collect();
    (added, removed)
}

pub struct GattServerCore {
    platform: Arc<dyn GattPlatform>,
    callbacks: Arc<dyn PeripheralCallbacks>,
    advertising: Arc<AdvertisingController>,
    radio: RwLock<RadioState>,
}

impl GattServerCore {
    pub fn new(
        platform: Arc<dyn GattPlatform>,
        callbacks: Arc<dyn PeripheralCallbacks>,
        advertising: Arc<AdvertisingController>,
    ) -> Self {
        let radio = platform.radio_state();
        Self {
            platform,
            callbacks,
            advertising,
            radio: RwLock::new(radio),
        }
    }

    // ------------------------------------------------------------------------
    // Radio state cache
    // ------------------------------------------------------------------------

    pub fn radio_state(&self) -> RadioState {
        *self.radio.read()
    }

    /// Seed the cache from the platform without notifying the application
    pub fn refresh_radio_state(&self) -> RadioState {
        let state = self.platform.radio_state();
        *self.radio.write() = state;
        state
    }

    pub fn handle_radio_state(&self, state: RadioState) {
        let previous = std::mem::replace(&mut *self.radio.write(), state);
        if previous == state {
            return;
        }
        info!("Radio state {} -> {}", previous, state);
        self.callbacks.on_adapter_state_changed(state);

        if state != RadioState::On && self.advertising.radio_lost() {
            let reason = format!("radio is {state}");
            self.callbacks
                .on_advertisement_status_changed(AdvertisementStatus::Aborted, Some(reason.as_str()));
        }
    }

    // ------------------------------------------------------------------------
    // Event entry points
    // ------------------------------------------------------------------------

    fn pending(&self, request: RequestId) -> PendingRequest {
        PendingRequest::new(request, self.platform.clone())
    }

    /// Answer an event whose attribute could not be resolved
    pub fn reject_unresolved(&self, event: PlatformEvent) {
        match event.request() {
            Some(request) => {
                warn!(
                    "Rejecting {} from unresolved source {:?}",
                    request,
                    event.source()
                );
                if let Err(e) = self.pending(request).reject(AttErrorCode::UnlikelyError) {
                    warn!("Failed to reject {}: {}", request, e);
                }
            }
            None => debug!("Dropping event from unresolved source {:?}", event.source()),
        }
    }

    pub async fn handle_event(&self, attribute: ResolvedAttribute, event: PlatformEvent) {
        match (attribute, event) {
            (
                ResolvedAttribute::Characteristic(characteristic),
                PlatformEvent::ReadRequested { request, link, .. },
            ) => {
                self.read_characteristic(&characteristic, self.pending(request), &link)
                    .await
            }
            (
                ResolvedAttribute::Characteristic(characteristic),
                PlatformEvent::WriteRequested {
                    request,
                    link,
                    value,
                    ..
                },
            ) => {
                let request = request.map(|id| self.pending(id));
                self.write_characteristic(&characteristic, request, &link, value)
                    .await
            }
            (
                ResolvedAttribute::Characteristic(characteristic),
                PlatformEvent::SubscribedClientsChanged { .. },
            ) => {
                self.subscriptions_changed(&characteristic);
            }
            (
                ResolvedAttribute::Descriptor(characteristic, descriptor),
                PlatformEvent::ReadRequested { request, link, .. },
            ) => {
                self.read_descriptor(&characteristic, &descriptor, self.pending(request), &link)
                    .await
            }
            (
                ResolvedAttribute::Descriptor(characteristic, descriptor),
                PlatformEvent::WriteRequested {
                    request,
                    link,
                    value,
                    ..
                },
            ) => {
                let request = request.map(|id| self.pending(id));
                self.write_descriptor(&characteristic, &descriptor, request, &link, value)
                    .await
            }
            (
                ResolvedAttribute::Service(service),
                PlatformEvent::AdvertisementStatusChanged { status, error, .. },
            ) => {
                self.advertisement_status_changed(&service, status, error.as_deref());
            }
            (_, event) => {
                warn!("Unexpected event for {:?}", event.source());
                if let Some(request) = event.request() {
                    if let Err(e) = self.pending(request).reject(AttErrorCode::RequestNotSupported) {
                        warn!("Failed to reject {}: {}", request, e);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    async fn read_characteristic(
        &self,
        characteristic: &CharacteristicEntry,
        request: PendingRequest,
        link: &LinkInfo,
    ) {
        let device_id = parse_client_id(link.client.as_str());
        let allowed = if characteristic.properties.contains(CharacteristicFlags::READ) {
            check_access(
                characteristic.permissions.read,
                link.encrypted,
                AttErrorCode::ReadNotPermitted,
            )
        } else {
            Err(AttErrorCode::ReadNotPermitted)
        };
        if let Err(code) = allowed {
            warn!(
                "Read of {} by {} rejected: {}",
                characteristic.id, device_id, code
            );
            complete(request.reject(code));
            return;
        }

        if let Some(fresh) = self
            .callbacks
            .on_characteristic_read(&characteristic.id, &device_id)
            .await
        {
            characteristic.set_value(fresh);
        }
        let value = characteristic.value();
        debug!(
            "Read of {} by {}: {} bytes",
            characteristic.id,
            device_id,
            value.len()
        );
        complete(request.respond(GattResponse::Value(value)));
    }

    async fn read_descriptor(
        &self,
        characteristic: &CharacteristicEntry,
        descriptor: &DescriptorEntry,
        request: PendingRequest,
        link: &LinkInfo,
    ) {
        if let Err(code) = check_access(
            descriptor.permissions.read,
            link.encrypted,
            AttErrorCode::ReadNotPermitted,
        ) {
            warn!(
                "Read of descriptor {}/{} rejected: {}",
                characteristic.id, descriptor.id, code
            );
            complete(request.reject(code));
            return;
        }

        if let Some(fresh) = self
            .callbacks
            .on_descriptor_read(&characteristic.id, &descriptor.id)
            .await
        {
            descriptor.set_value(fresh);
        }
        complete(request.respond(GattResponse::Value(descriptor.value())));
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    async fn write_characteristic(
        &self,
        characteristic: &CharacteristicEntry,
        request: Option<PendingRequest>,
        link: &LinkInfo,
        value: Vec<u8>,
    ) {
        let device_id = parse_client_id(link.client.as_str());
        let writable = characteristic.properties.intersects(
            CharacteristicFlags::WRITE | CharacteristicFlags::WRITE_WITHOUT_RESPONSE,
        );
        let allowed = if writable {
            check_access(
                characteristic.permissions.write,
                link.encrypted,
                AttErrorCode::WriteNotPermitted,
            )
        } else {
            Err(AttErrorCode::WriteNotPermitted)
        };
        if let Err(code) = allowed {
            warn!(
                "Write to {} by {} rejected: {}",
                characteristic.id, device_id, code
            );
            if let Some(request) = request {
                complete(request.reject(code));
            }
            return;
        }

        debug!(
            "Write to {} by {}: {}",
            characteristic.id,
            device_id,
            hex::encode(&value)
        );
        let previous = characteristic.set_value(value.clone());
        let accepted = self
            .callbacks
            .on_characteristic_write(&characteristic.id, &value, &device_id)
            .await;

        match (accepted, request) {
            (Ok(()), Some(request)) => complete(request.respond(GattResponse::WriteAccepted)),
            (Ok(()), None) => {}
            (Err(code), request) => {
                warn!(
                    "Application rejected write to {} by {}: {}",
                    characteristic.id, device_id, code
                );
                characteristic.restore_value(&value, previous);
                if let Some(request) = request {
                    complete(request.reject(code));
                }
            }
        }
    }

    async fn write_descriptor(
        &self,
        characteristic: &CharacteristicEntry,
        descriptor: &DescriptorEntry,
        request: Option<PendingRequest>,
        link: &LinkInfo,
        value: Vec<u8>,
    ) {
        if let Err(code) = check_access(
            descriptor.permissions.write,
            link.encrypted,
            AttErrorCode::WriteNotPermitted,
        ) {
            warn!(
                "Write to descriptor {}/{} rejected: {}",
                characteristic.id, descriptor.id, code
            );
            if let Some(request) = request {
                complete(request.reject(code));
            }
            return;
        }

        let previous = descriptor.set_value(value.clone());
        let accepted = self
            .callbacks
            .on_descriptor_write(&characteristic.id, &descriptor.id, &value)
            .await;

        match (accepted, request) {
            (Ok(()), Some(request)) => complete(request.respond(GattResponse::WriteAccepted)),
            (Ok(()), None) => {}
            (Err(code), request) => {
                descriptor.restore_value(&value, previous);
                if let Some(request) = request {
                    complete(request.reject(code));
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Recompute the subscriber set from the live view and store it.
    /// Returns the change, or `None` when the set is unchanged.
    fn refresh_subscribers(&self, characteristic: &CharacteristicEntry) -> Option<SubscriptionChange> {
        let clients: Vec<SubscribedClient> = self
            .platform
            .subscribed_clients(characteristic.handle)
            .into_iter()
            .map(SubscribedClient::from_token)
            .collect();
        let previous = characteristic.replace_subscribers(clients.clone());
        let (added, removed) = diff_subscribers(&previous, &clients);
        if added.is_empty() && removed.is_empty() {
            return None;
        }
        Some(SubscriptionChange {
            characteristic_id: characteristic.id.clone(),
            clients,
            added,
            removed,
        })
    }

    fn subscriptions_changed(&self, characteristic: &CharacteristicEntry) {
        match self.refresh_subscribers(characteristic) {
            Some(change) => {
                info!(
                    "Subscribers of {}: {} (+{} -{})",
                    change.characteristic_id,
                    change.clients.len(),
                    change.added.len(),
                    change.removed.len()
                );
                self.callbacks.on_subscription_changed(&change);
            }
            None => debug!("Subscribers of {} unchanged", characteristic.id),
        }
    }

    // ------------------------------------------------------------------------
    // Advertising
    // ------------------------------------------------------------------------

    fn advertisement_status_changed(
        &self,
        service: &ServiceEntry,
        status: AdvertisementStatus,
        error: Option<&str>,
    ) {
        let outcome = self.advertising.record_status(service.handle, status);
        debug!(
            "Advertisement of {} is {} ({:?})",
            service.id, status, outcome
        );
        if outcome == StatusOutcome::Stale {
            return;
        }
        if status.is_failure() {
            warn!(
                "Advertisement of {} failed: {} {}",
                service.id,
                status,
                error.unwrap_or_default()
            );
        }
        self.callbacks.on_advertisement_status_changed(status, error);
    }

    // ------------------------------------------------------------------------
    // Outbound updates
    // ------------------------------------------------------------------------

    /// Store `value` and push it to subscribers, or only to `device_id`.
    /// Returns the number of deliveries made.
    pub fn update_characteristic(
        &self,
        characteristic: &CharacteristicEntry,
        value: Vec<u8>,
        device_id: Option<&str>,
    ) -> Result<usize, PeripheralError> {
        characteristic.set_value(value.clone());
        if !characteristic.properties.can_push() {
            debug!("{} cannot notify; value stored only", characteristic.id);
            return Ok(0);
        }

        // Targeting only; the stored set belongs to the dispatcher lane
        let subscribers: Vec<SubscribedClient> = self
            .platform
            .subscribed_clients(characteristic.handle)
            .into_iter()
            .map(SubscribedClient::from_token)
            .collect();

        let delivered = match device_id {
            Some(device_id) => {
                let client = subscribers
                    .iter()
                    .find(|c| c.device_id == device_id || c.token.as_str() == device_id)
                    .ok_or_else(|| {
                        PeripheralError::NotFound(format!(
                            "device {device_id} is not subscribed to {}",
                            characteristic.id
                        ))
                    })?;
                self.platform
                    .notify(characteristic.handle, &value, Some(&client.token))?
            }
            None if subscribers.is_empty() => 0,
            None => self.platform.notify(characteristic.handle, &value, None)?,
        };
        debug!(
            "Pushed {} bytes of {} to {} clients",
            value.len(),
            characteristic.id,
            delivered
        );
        Ok(delivered)
    }
}

/// Log a failed completion; the request is consumed either way
fn complete(result: Result<(), crate::platform::PlatformError>) {
    if let Err(e) = result {
        warn!("Request completion failed: {}", e);
    }
}
