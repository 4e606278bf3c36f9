// Integration tests for concurrent access
//
// Many centrals hitting the same attribute, slow application handlers, and
// registry mutation racing with readers, on a multi-threaded runtime.

mod common;

use ble_peripheral_core::platform::{
    AdvertisingParameters, CharacteristicParameters, ClientToken, DescriptorParameters, EventKind,
    EventSink, EventToken, GattResponse, ObjectHandle, PlatformError, RequestId,
};
use ble_peripheral_core::{
    BleCharacteristic, BlePeripheral, BleService, GattPlatform, RadioState, SimulatedPlatform,
};
use common::*;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_to_one_characteristic() {
    let h = harness();
    h.peripheral
        .add_service(&heart_rate_service())
        .expect("add service");
    let handle = h.platform.characteristic_handle(CONTROL_POINT).expect("handle");

    let mut writers = Vec::new();
    for writer in 0..8u8 {
        let platform = h.platform.clone();
        writers.push(tokio::spawn(async move {
            let client = client_token(&format!("10:{writer:02x}"));
            let mut requests = Vec::new();
            for n in 0..10u8 {
                requests.extend(platform.write(handle, &client, &[writer, n], false, true));
            }
            requests
        }));
    }

    let requests: Vec<_> = futures::future::join_all(writers)
        .await
        .into_iter()
        .flat_map(|r| r.expect("writer task"))
        .collect();
    assert_eq!(requests.len(), 80);

    for request in &requests {
        assert_eq!(
            h.platform.wait_for_response(*request, RESPONSE_TIMEOUT).await,
            Some(GattResponse::WriteAccepted)
        );
    }
    assert_eq!(h.callbacks.write_count(), 80);
    assert_eq!(h.platform.duplicate_responses(), 0);

    // The stored value is one of the values written
    let services = h.peripheral.get_services().expect("services");
    let value = services[0].characteristics[2].value.clone().expect("value");
    assert_eq!(value.len(), 2);
    assert!(value[0] < 8 && value[1] < 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_writes_to_one_attribute_keep_arrival_order() {
    let h = harness();
    h.peripheral
        .add_service(&heart_rate_service())
        .expect("add service");
    let handle = h.platform.characteristic_handle(CONTROL_POINT).expect("handle");

    let client = client_token("aa:bb");
    for n in 0..25u8 {
        h.platform.write(handle, &client, &[n], false, false);
    }

    assert!(eventually(|| h.callbacks.write_count() == 25).await);
    let order: Vec<u8> = h
        .callbacks
        .writes
        .lock()
        .iter()
        .map(|(_, value, _)| value[0])
        .collect();
    assert_eq!(order, (0..25).collect::<Vec<u8>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_handler_does_not_stall_other_attributes() {
    let h = harness();
    h.peripheral
        .add_service(&heart_rate_service())
        .expect("add service");
    *h.callbacks.slow_writes.lock() =
        Some((canonical(CONTROL_POINT), Duration::from_millis(500)));

    let control = h.platform.characteristic_handle(CONTROL_POINT).expect("handle");
    let measurement = h
        .platform
        .characteristic_handle(HEART_RATE_MEASUREMENT)
        .expect("handle");

    let slow = h
        .platform
        .write(control, &client_token("aa:bb"), &[1], false, true)
        .expect("request id");
    let fast = h.platform.read(measurement, &client_token("cc:dd"), false);

    assert_eq!(
        h.platform
            .wait_for_response(fast, Duration::from_millis(250))
            .await,
        Some(GattResponse::Value(vec![0x00, 0x48]))
    );
    // The slow write is still waiting on its handler
    assert_eq!(h.platform.response(slow), None);

    assert_eq!(
        h.platform.wait_for_response(slow, RESPONSE_TIMEOUT).await,
        Some(GattResponse::WriteAccepted)
    );
}

fn numbered_service(n: u16) -> BleService {
    BleService {
        uuid: format!("{:08x}-0000-4000-8000-00000000beef", n),
        primary: true,
        characteristics: vec![
            BleCharacteristic {
                uuid: format!("{:08x}-0001-4000-8000-00000000beef", n),
                properties: vec![1, 3, 4],
                permissions: vec![],
                descriptors: vec![],
                value: Some(vec![n as u8]),
            },
            BleCharacteristic {
                uuid: format!("{:08x}-0002-4000-8000-00000000beef", n),
                properties: vec![1],
                permissions: vec![0],
                descriptors: vec![],
                value: None,
            },
        ],
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_add_and_get_never_see_partial_services() {
    let h = harness();
    let peripheral = Arc::new(h.peripheral);

    let mut tasks = Vec::new();
    for n in 0..16u16 {
        let peripheral = peripheral.clone();
        tasks.push(tokio::spawn(async move {
            peripheral
                .add_service(&numbered_service(n))
                .expect("add service");
        }));
    }
    for _ in 0..4 {
        let peripheral = peripheral.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..50 {
                for service in peripheral.get_services().expect("services") {
                    assert_eq!(service.characteristics.len(), 2);
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    for task in futures::future::join_all(tasks).await {
        task.expect("task");
    }

    assert_eq!(peripheral.get_services().expect("services").len(), 16);
    // 2 characteristics x 3 events + 1 provider event per service
    assert_eq!(h.platform.live_subscriptions(), 16 * 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_add_and_remove_keep_indices_consistent() {
    let h = harness();
    let peripheral = Arc::new(h.peripheral);
    for n in 0..8u16 {
        peripheral
            .add_service(&numbered_service(n))
            .expect("add service");
    }

    let mut tasks = Vec::new();
    for n in 0..8u16 {
        let peripheral = peripheral.clone();
        tasks.push(tokio::spawn(async move {
            let id = numbered_service(n).uuid;
            peripheral.remove_service(&id).expect("remove service");
        }));
    }
    for n in 8..16u16 {
        let peripheral = peripheral.clone();
        tasks.push(tokio::spawn(async move {
            peripheral
                .add_service(&numbered_service(n))
                .expect("add service");
        }));
    }
    for task in futures::future::join_all(tasks).await {
        task.expect("task");
    }

    let services = peripheral.get_services().expect("services");
    assert_eq!(services.len(), 8);
    for n in 0..8u16 {
        let characteristic = &numbered_service(n).characteristics[0].uuid;
        assert!(peripheral
            .update_characteristic(characteristic, &[0], None)
            .is_err());
    }
    for n in 8..16u16 {
        let characteristic = &numbered_service(n).characteristics[0].uuid;
        assert_eq!(
            peripheral
                .update_characteristic(characteristic, &[0], None)
                .expect("update"),
            0
        );
    }
    assert_eq!(h.platform.live_subscriptions(), 8 * 7);
    assert_eq!(h.platform.dangling_releases(), 0);
}

const UPDATE_THREAD: &str = "app-update";

/// Simulated stack whose subscriber lookups from the update thread answer
/// with a snapshot taken `lag` earlier
struct LaggingClientView {
    inner: Arc<SimulatedPlatform>,
    lag: Duration,
}

impl GattPlatform for LaggingClientView {
    fn radio_state(&self) -> RadioState {
        self.inner.radio_state()
    }

    fn watch_radio(&self, sink: EventSink) -> Result<EventToken, PlatformError> {
        self.inner.watch_radio(sink)
    }

    fn create_service_provider(&self, uuid: Uuid) -> Result<ObjectHandle, PlatformError> {
        self.inner.create_service_provider(uuid)
    }

    fn create_characteristic(
        &self,
        service: ObjectHandle,
        params: &CharacteristicParameters,
    ) -> Result<ObjectHandle, PlatformError> {
        self.inner.create_characteristic(service, params)
    }

    fn create_descriptor(
        &self,
        characteristic: ObjectHandle,
        params: &DescriptorParameters,
    ) -> Result<ObjectHandle, PlatformError> {
        self.inner.create_descriptor(characteristic, params)
    }

    fn subscribe(
        &self,
        source: ObjectHandle,
        kind: EventKind,
        sink: EventSink,
    ) -> Result<EventToken, PlatformError> {
        self.inner.subscribe(source, kind, sink)
    }

    fn unsubscribe(&self, token: EventToken) -> Result<(), PlatformError> {
        self.inner.unsubscribe(token)
    }

    fn release_service_provider(&self, service: ObjectHandle) -> Result<(), PlatformError> {
        self.inner.release_service_provider(service)
    }

    fn subscribed_clients(&self, characteristic: ObjectHandle) -> Vec<ClientToken> {
        let snapshot = self.inner.subscribed_clients(characteristic);
        if std::thread::current().name() == Some(UPDATE_THREAD) {
            std::thread::sleep(self.lag);
        }
        snapshot
    }

    fn notify(
        &self,
        characteristic: ObjectHandle,
        value: &[u8],
        client: Option<&ClientToken>,
    ) -> Result<usize, PlatformError> {
        self.inner.notify(characteristic, value, client)
    }

    fn respond(&self, request: RequestId, response: GattResponse) -> Result<(), PlatformError> {
        self.inner.respond(request, response)
    }

    fn start_advertising(
        &self,
        service: ObjectHandle,
        params: &AdvertisingParameters,
    ) -> Result<(), PlatformError> {
        self.inner.start_advertising(service, params)
    }

    fn stop_advertising(&self, service: ObjectHandle) -> Result<(), PlatformError> {
        self.inner.stop_advertising(service)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_update_racing_unsubscribe_reports_current_subscribers() {
    // Push from an application thread while a central unsubscribes. Only the
    // dispatcher may change the subscriber set the application is told about.
    let platform = Arc::new(SimulatedPlatform::default());
    let view = Arc::new(LaggingClientView {
        inner: platform.clone(),
        lag: Duration::from_millis(300),
    });
    let callbacks = Arc::new(RecordingCallbacks::default());
    let peripheral = Arc::new(BlePeripheral::new(view, callbacks.clone()));
    peripheral.initialize().expect("initialize");
    peripheral
        .add_service(&heart_rate_service())
        .expect("add service");
    let handle = platform
        .characteristic_handle(HEART_RATE_MEASUREMENT)
        .expect("handle");

    platform.subscribe_client(handle, &client_token("aa:aa"));
    platform.subscribe_client(handle, &client_token("bb:bb"));
    assert!(eventually(|| {
        callbacks
            .subscriptions
            .lock()
            .last()
            .map(|change| change.clients.len())
            == Some(2)
    })
    .await);
    let reported_before = callbacks.subscriptions.lock().len();

    let updater = {
        let peripheral = peripheral.clone();
        std::thread::Builder::new()
            .name(UPDATE_THREAD.to_string())
            .spawn(move || {
                peripheral.update_characteristic(HEART_RATE_MEASUREMENT, &[0x00, 0x70], None)
            })
            .expect("spawn updater")
    };

    // The updater is now holding a snapshot that still contains bb:bb
    tokio::time::sleep(Duration::from_millis(50)).await;
    platform.unsubscribe_client(handle, &client_token("bb:bb"));
    assert!(eventually(|| callbacks.subscriptions.lock().len() == reported_before + 1).await);

    tokio::task::spawn_blocking(move || updater.join())
        .await
        .expect("join task")
        .expect("updater thread")
        .expect("update");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let changes = callbacks.subscriptions.lock().clone();
    assert_eq!(changes.len(), reported_before + 1);
    let last = changes.last().expect("change");
    assert_eq!(last.removed.len(), 1);
    assert_eq!(last.removed[0].device_id, "bb:bb");
    assert!(last.added.is_empty());
    assert_eq!(last.clients.len(), platform.subscribed_clients(handle).len());
    assert_eq!(last.clients[0].device_id, "aa:aa");

    // Stored value still moved
    let services = peripheral.get_services().expect("services");
    assert_eq!(services[0].characteristics[0].value, Some(vec![0x00, 0x70]));
    println!("✓ application told the live subscriber set after a racing update");
}
