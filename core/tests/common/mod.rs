// Shared fixtures for the peripheral integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ble_peripheral_core::{
    parse_uuid, AdvertisementStatus, AttErrorCode, BleCharacteristic, BleDescriptor,
    BlePeripheral, BleService, PeripheralCallbacks, RadioState, SimulatedPlatform,
    SubscriptionChange,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const HEART_RATE_SERVICE: &str = "180D";
pub const HEART_RATE_MEASUREMENT: &str = "2A37";
pub const BODY_SENSOR_LOCATION: &str = "2A38";
pub const CONTROL_POINT: &str = "2A39";
pub const USER_DESCRIPTION: &str = "2901";

pub const BATTERY_SERVICE: &str = "180F";
pub const BATTERY_LEVEL: &str = "2A19";

/// Client tokens the way the radio stack formats them
pub fn client_token(remote: &str) -> String {
    format!("BluetoothLE#BluetoothLE00:1a:7d:da:71:13-{remote}")
}

/// Canonical id as reported back by the peripheral
pub fn canonical(id: &str) -> String {
    parse_uuid(id).expect("valid uuid").to_string()
}

/// Heart rate service:
/// - measurement: read + notify, open, with a user description descriptor
/// - sensor location: read only, encryption required
/// - control point: write (with and without response), write only
pub fn heart_rate_service() -> BleService {
    BleService {
        uuid: HEART_RATE_SERVICE.to_string(),
        primary: true,
        characteristics: vec![
            BleCharacteristic {
                uuid: HEART_RATE_MEASUREMENT.to_string(),
                properties: vec![1, 4],
                permissions: vec![0],
                descriptors: vec![BleDescriptor {
                    uuid: USER_DESCRIPTION.to_string(),
                    value: Some(b"Heart Rate".to_vec()),
                    permissions: vec![0, 1],
                }],
                value: Some(vec![0x00, 0x48]),
            },
            BleCharacteristic {
                uuid: BODY_SENSOR_LOCATION.to_string(),
                properties: vec![1],
                permissions: vec![2],
                descriptors: vec![],
                value: Some(vec![0x01]),
            },
            BleCharacteristic {
                uuid: CONTROL_POINT.to_string(),
                properties: vec![2, 3],
                permissions: vec![1],
                descriptors: vec![],
                value: None,
            },
        ],
    }
}

pub fn battery_service() -> BleService {
    BleService {
        uuid: BATTERY_SERVICE.to_string(),
        primary: true,
        characteristics: vec![BleCharacteristic {
            uuid: BATTERY_LEVEL.to_string(),
            properties: vec![1, 4],
            permissions: vec![],
            descriptors: vec![],
            value: Some(vec![100]),
        }],
    }
}

pub const USER_DATA_SERVICE: &str = "181C";
pub const USER_INDEX: &str = "2A9A";

/// User data service whose writes and descriptor traffic need an encrypted link
pub fn secure_service() -> BleService {
    BleService {
        uuid: USER_DATA_SERVICE.to_string(),
        primary: true,
        characteristics: vec![BleCharacteristic {
            uuid: USER_INDEX.to_string(),
            properties: vec![1, 3],
            permissions: vec![0, 3],
            descriptors: vec![BleDescriptor {
                uuid: USER_DESCRIPTION.to_string(),
                value: Some(b"User".to_vec()),
                permissions: vec![2, 3],
            }],
            value: Some(vec![0x01]),
        }],
    }
}

/// Callbacks that record everything and can be told how to answer
#[derive(Default)]
pub struct RecordingCallbacks {
    pub reads: Mutex<Vec<(String, String)>>,
    pub writes: Mutex<Vec<(String, Vec<u8>, String)>>,
    pub descriptor_writes: Mutex<Vec<(String, String, Vec<u8>)>>,
    pub subscriptions: Mutex<Vec<SubscriptionChange>>,
    pub radio: Mutex<Vec<RadioState>>,
    pub advertising: Mutex<Vec<(AdvertisementStatus, Option<String>)>>,
    /// Value handed back from `on_characteristic_read`
    pub read_value: Mutex<Option<Vec<u8>>>,
    /// Error returned from `on_characteristic_write`
    pub reject_writes: Mutex<Option<AttErrorCode>>,
    /// Characteristic whose write handler takes this long
    pub slow_writes: Mutex<Option<(String, Duration)>>,
    /// Read and write handlers panic while set
    pub panicking: Mutex<bool>,
}

impl RecordingCallbacks {
    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn advertising_events(&self) -> Vec<(AdvertisementStatus, Option<String>)> {
        self.advertising.lock().clone()
    }
}

#[async_trait]
impl PeripheralCallbacks for RecordingCallbacks {
    async fn on_characteristic_read(
        &self,
        characteristic_id: &str,
        device_id: &str,
    ) -> Option<Vec<u8>> {
        let panicking = *self.panicking.lock();
        if panicking {
            panic!("read handler for {characteristic_id} failed");
        }
        self.reads
            .lock()
            .push((characteristic_id.to_string(), device_id.to_string()));
        self.read_value.lock().clone()
    }

    async fn on_characteristic_write(
        &self,
        characteristic_id: &str,
        value: &[u8],
        device_id: &str,
    ) -> Result<(), AttErrorCode> {
        let panicking = *self.panicking.lock();
        if panicking {
            panic!("write handler for {characteristic_id} failed");
        }
        let delay = self
            .slow_writes
            .lock()
            .as_ref()
            .filter(|(id, _)| id == characteristic_id)
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.writes.lock().push((
            characteristic_id.to_string(),
            value.to_vec(),
            device_id.to_string(),
        ));
        match *self.reject_writes.lock() {
            Some(code) => Err(code),
            None => Ok(()),
        }
    }

    async fn on_descriptor_write(
        &self,
        characteristic_id: &str,
        descriptor_id: &str,
        value: &[u8],
    ) -> Result<(), AttErrorCode> {
        self.descriptor_writes.lock().push((
            characteristic_id.to_string(),
            descriptor_id.to_string(),
            value.to_vec(),
        ));
        Ok(())
    }

    fn on_subscription_changed(&self, change: &SubscriptionChange) {
        self.subscriptions.lock().push(change.clone());
    }

    fn on_adapter_state_changed(&self, state: RadioState) {
        self.radio.lock().push(state);
    }

    fn on_advertisement_status_changed(&self, status: AdvertisementStatus, error: Option<&str>) {
        self.advertising
            .lock()
            .push((status, error.map(str::to_string)));
    }
}

pub struct Harness {
    pub platform: Arc<SimulatedPlatform>,
    pub callbacks: Arc<RecordingCallbacks>,
    pub peripheral: BlePeripheral,
}

/// Initialized peripheral over a simulated radio. Call from inside a runtime.
pub fn harness_with_radio(radio: RadioState) -> Harness {
    let platform = Arc::new(SimulatedPlatform::new(radio));
    let callbacks = Arc::new(RecordingCallbacks::default());
    let peripheral = BlePeripheral::new(platform.clone(), callbacks.clone());
    peripheral.initialize().expect("initialize");
    Harness {
        platform,
        callbacks,
        peripheral,
    }
}

pub fn harness() -> Harness {
    harness_with_radio(RadioState::On)
}

pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
