//! Application facade
//!
//! [`BlePeripheral`] is what an application holds. It wires the registry,
//! the advertising controller, the server core and the dispatcher worker
//! together on `initialize`, and takes them apart again on `dispose` (or when
//! dropped). Application code is called back through [`PeripheralCallbacks`].

use crate::gatt::advertising::{AdvertisingController, AdvertisingRequest};
use crate::gatt::dispatcher::{EventDispatcher, EventSubscriber};
use crate::gatt::model::{AttErrorCode, BleService, SubscriptionChange};
use crate::gatt::registry::ServiceRegistry;
use crate::gatt::server::GattServerCore;
use crate::platform::{
    AdvertisementStatus, AdvertisingParameters, EventSink, EventToken, GattPlatform,
    PeripheralSettings, RadioState,
};
use crate::PeripheralError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// CALLBACKS
// ============================================================================

/// Application hooks. Every method has a no-op default.
///
/// Calls for one attribute arrive in the order the radio stack raised the
/// events; calls for different attributes may interleave.
#[async_trait]
pub trait PeripheralCallbacks: Send + Sync {
    /// A central reads a characteristic. Returning a value replaces the
    /// stored one before the read is answered.
    async fn on_characteristic_read(
        &self,
        _characteristic_id: &str,
        _device_id: &str,
    ) -> Option<Vec<u8>> {
        None
    }

    /// A central wrote a characteristic. The request is completed once this
    /// resolves; an error restores the previous value and is sent back.
    async fn on_characteristic_write(
        &self,
        _characteristic_id: &str,
        _value: &[u8],
        _device_id: &str,
    ) -> Result<(), AttErrorCode> {
        Ok(())
    }

    async fn on_descriptor_read(
        &self,
        _characteristic_id: &str,
        _descriptor_id: &str,
    ) -> Option<Vec<u8>> {
        None
    }

    async fn on_descriptor_write(
        &self,
        _characteristic_id: &str,
        _descriptor_id: &str,
        _value: &[u8],
    ) -> Result<(), AttErrorCode> {
        Ok(())
    }

    fn on_subscription_changed(&self, _change: &SubscriptionChange) {}

    fn on_adapter_state_changed(&self, _state: RadioState) {}

    /// Advertisement transitions, including asynchronous failures
    fn on_advertisement_status_changed(&self, _status: AdvertisementStatus, _error: Option<&str>) {}
}

/// Callbacks that accept everything and report nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl PeripheralCallbacks for NoopCallbacks {}

// ============================================================================
// PERIPHERAL
// ============================================================================

/// Components alive between `initialize` and `dispose`
struct Runtime {
    handle: Handle,
    registry: Arc<ServiceRegistry>,
    server: Arc<GattServerCore>,
    advertising: Arc<AdvertisingController>,
    subscriber: EventSubscriber,
    radio_token: EventToken,
    advertising_timeout: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    fn cancel_timeout(&self) {
        if let Some(task) = self.advertising_timeout.lock().take() {
            task.abort();
        }
    }
}

pub struct BlePeripheral {
    platform: Arc<dyn GattPlatform>,
    callbacks: Arc<dyn PeripheralCallbacks>,
    settings: PeripheralSettings,
    runtime: RwLock<Option<Arc<Runtime>>>,
}

impl BlePeripheral {
    pub fn new(platform: Arc<dyn GattPlatform>, callbacks: Arc<dyn PeripheralCallbacks>) -> Self {
        Self {
            platform,
            callbacks,
            settings: PeripheralSettings::default(),
            runtime: RwLock::new(None),
        }
    }

    pub fn with_settings(
        platform: Arc<dyn GattPlatform>,
        callbacks: Arc<dyn PeripheralCallbacks>,
        settings: PeripheralSettings,
    ) -> Result<Self, PeripheralError> {
        settings
            .validate()
            .map_err(|e| PeripheralError::InvalidArgument(e.to_string()))?;
        Ok(Self {
            platform,
            callbacks,
            settings,
            runtime: RwLock::new(None),
        })
    }

    pub fn settings(&self) -> &PeripheralSettings {
        &self.settings
    }

    fn runtime(&self) -> Result<Arc<Runtime>, PeripheralError> {
        self.runtime
            .read()
            .clone()
            .ok_or_else(|| PeripheralError::InvalidState("peripheral not initialized".to_string()))
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start the dispatcher and begin tracking the radio. Must be called from
    /// within a tokio runtime; calling it again is a no-op.
    pub fn initialize(&self) -> Result<(), PeripheralError> {
        let mut slot = self.runtime.write();
        if slot.is_some() {
            debug!("initialize called twice; already running");
            return Ok(());
        }

        let handle = Handle::try_current().map_err(|_| {
            PeripheralError::InvalidState("initialize requires a tokio runtime".to_string())
        })?;

        let (sink, rx) = EventSink::channel();
        let subscriber = EventSubscriber::new(self.platform.clone(), sink.clone());
        let advertising = Arc::new(AdvertisingController::new(self.platform.clone()));
        let server = Arc::new(GattServerCore::new(
            self.platform.clone(),
            self.callbacks.clone(),
            advertising.clone(),
        ));
        let registry = Arc::new(ServiceRegistry::new(
            self.platform.clone(),
            subscriber.clone(),
        ));

        let radio_token = self.platform.watch_radio(sink)?;
        let radio = server.refresh_radio_state();

        handle.spawn(EventDispatcher::new(registry.clone(), server.clone()).run(rx));

        *slot = Some(Arc::new(Runtime {
            handle,
            registry,
            server,
            advertising,
            subscriber,
            radio_token,
            advertising_timeout: Mutex::new(None),
        }));
        info!("BLE peripheral initialized (radio {})", radio);
        Ok(())
    }

    /// Stop advertising, tear down every service and stop the dispatcher.
    /// The peripheral can be initialized again afterwards.
    pub fn dispose(&self) -> Result<(), PeripheralError> {
        let Some(runtime) = self.runtime.write().take() else {
            return Ok(());
        };

        runtime.cancel_timeout();
        if let Err(e) = runtime.advertising.stop() {
            warn!("Stopping advertising during dispose failed: {}", e);
        }
        let torn_down = runtime.registry.teardown();
        if let Err(e) = self.platform.unsubscribe(runtime.radio_token) {
            warn!("Failed to stop radio watch: {}", e);
        }
        runtime.subscriber.shutdown();
        info!("BLE peripheral disposed");
        torn_down
    }

    // ------------------------------------------------------------------------
    // Radio
    // ------------------------------------------------------------------------

    /// Whether a Bluetooth radio exists
    pub fn is_supported(&self) -> Result<bool, PeripheralError> {
        Ok(self.runtime()?.server.radio_state().is_present())
    }

    /// Whether the radio is usable right now
    pub fn ask_ble_permission(&self) -> Result<bool, PeripheralError> {
        match self.runtime()?.server.radio_state() {
            RadioState::On => Ok(true),
            RadioState::Off | RadioState::Disabled => Ok(false),
            RadioState::Unauthorized => Err(PeripheralError::PermissionDenied),
            RadioState::Unknown => Err(PeripheralError::NotSupported(
                "no Bluetooth radio".to_string(),
            )),
        }
    }

    pub fn radio_state(&self) -> Result<RadioState, PeripheralError> {
        Ok(self.runtime()?.server.radio_state())
    }

    // ------------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------------

    pub fn add_service(&self, service: &BleService) -> Result<(), PeripheralError> {
        self.runtime()?.registry.add_service(service).map(|_| ())
    }

    pub fn remove_service(&self, service_id: &str) -> Result<(), PeripheralError> {
        let runtime = self.runtime()?;
        if let Some(entry) = runtime.registry.find_service(service_id) {
            runtime.advertising.forget_provider(entry.handle);
        }
        runtime.registry.remove_service(service_id)
    }

    pub fn clear_services(&self) -> Result<(), PeripheralError> {
        let runtime = self.runtime()?;
        runtime.cancel_timeout();
        if let Err(e) = runtime.advertising.stop() {
            warn!("Stopping advertising before clearing services failed: {}", e);
        }
        runtime.registry.clear_services()
    }

    pub fn get_services(&self) -> Result<Vec<BleService>, PeripheralError> {
        Ok(self.runtime()?.registry.get_services())
    }

    /// Store a new value and push it to subscribers (all of them, or only
    /// `device_id`). Returns the number of deliveries made.
    pub fn update_characteristic(
        &self,
        characteristic_id: &str,
        value: &[u8],
        device_id: Option<&str>,
    ) -> Result<usize, PeripheralError> {
        let runtime = self.runtime()?;
        let characteristic = runtime
            .registry
            .find_characteristic(characteristic_id)
            .ok_or_else(|| {
                PeripheralError::NotFound(format!("characteristic {characteristic_id}"))
            })?;
        runtime
            .server
            .update_characteristic(&characteristic, value.to_vec(), device_id)
    }

    // ------------------------------------------------------------------------
    // Advertising
    // ------------------------------------------------------------------------

    pub fn start_advertising(&self, request: AdvertisingRequest) -> Result<(), PeripheralError> {
        let runtime = self.runtime()?;
        if request.timeout == Some(Duration::ZERO) {
            return Err(PeripheralError::InvalidArgument(
                "advertising timeout must be positive".to_string(),
            ));
        }

        let radio = runtime.server.radio_state();
        if !radio.is_present() {
            return Err(PeripheralError::NotSupported("no Bluetooth radio".to_string()));
        }
        if runtime.advertising.is_advertising() {
            return Err(PeripheralError::AlreadyAdvertising);
        }

        let targets = runtime.registry.advertisable(&request.service_ids)?;
        let params = AdvertisingParameters {
            connectable: self.settings.connectable,
            discoverable: self.settings.discoverable,
            local_name: request.local_name.clone(),
            manufacturer_data: request.manufacturer_data.clone(),
            manufacturer_data_in_scan_response: request.include_manufacturer_data_in_scan_response,
        };
        let generation = runtime.advertising.start(radio, &targets, &params)?;

        let timeout = request
            .timeout
            .or_else(|| self.settings.default_advertising_timeout());
        if let Some(timeout) = timeout {
            let advertising = runtime.advertising.clone();
            let task = runtime.handle.spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Err(e) = advertising.stop_generation(generation) {
                    warn!("Stopping timed out advertisement failed: {}", e);
                }
            });
            if let Some(previous) = runtime.advertising_timeout.lock().replace(task) {
                previous.abort();
            }
            debug!("Advertising session {} times out in {:?}", generation, timeout);
        }
        Ok(())
    }

    pub fn stop_advertising(&self) -> Result<(), PeripheralError> {
        let runtime = self.runtime()?;
        runtime.cancel_timeout();
        runtime.advertising.stop()
    }

    /// `None` when there is no radio to advertise with
    pub fn is_advertising(&self) -> Result<Option<bool>, PeripheralError> {
        let runtime = self.runtime()?;
        if !runtime.server.radio_state().is_present() {
            return Ok(None);
        }
        Ok(Some(runtime.advertising.is_advertising()))
    }

    /// Most recent advertisement status reported by the stack
    pub fn advertisement_status(&self) -> Result<Option<AdvertisementStatus>, PeripheralError> {
        Ok(self.runtime()?.advertising.status())
    }
}

impl Drop for BlePeripheral {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!("Teardown on drop reported failures: {}", e);
        }
    }
}
