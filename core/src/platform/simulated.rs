//! In-memory radio stack
//!
//! `SimulatedPlatform` implements [`GattPlatform`] without hardware and plays
//! the remote side as well: it can raise read/write/subscribe requests as if
//! centrals were connected, and it records every response and value push so
//! callers can inspect what the core did. It also keeps the bookkeeping needed
//! to check resource hygiene (live subscriptions, releases that happened while
//! subscriptions were still live, duplicate responses).

use super::{
    AdvertisementStatus, AdvertisingParameters, CharacteristicParameters, ClientToken,
    DescriptorParameters, EventKind, EventSink, EventToken, GattPlatform, GattResponse, LinkInfo,
    ObjectHandle, PlatformError, PlatformEvent, RadioState, RequestId,
};
use crate::gatt::model::parse_uuid;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// A value push recorded by the simulated stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: ObjectHandle,
    pub client: ClientToken,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
enum ObjectKind {
    ServiceProvider,
    Characteristic(CharacteristicParameters),
    Descriptor,
}

#[derive(Debug, Clone)]
struct SimObject {
    kind: ObjectKind,
    uuid: Uuid,
    parent: Option<ObjectHandle>,
}

#[derive(Debug)]
struct Subscription {
    source: ObjectHandle,
    kind: EventKind,
    sink: EventSink,
}

#[derive(Debug)]
struct SimState {
    next_id: u64,
    radio: RadioState,
    radio_watchers: HashMap<EventToken, EventSink>,
    objects: HashMap<ObjectHandle, SimObject>,
    subscriptions: HashMap<EventToken, Subscription>,
    subscribe_calls: usize,
    unsubscribe_calls: usize,
    subscribers: HashMap<ObjectHandle, Vec<ClientToken>>,
    pending: HashSet<RequestId>,
    responses: HashMap<RequestId, GattResponse>,
    duplicate_responses: usize,
    notifications: Vec<Notification>,
    advertising: HashMap<ObjectHandle, AdvertisingParameters>,
    failing_releases: HashSet<Uuid>,
    failing_creates: HashSet<Uuid>,
    dangling_releases: usize,
}

impl SimState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn sinks_for(&self, source: ObjectHandle, kind: EventKind) -> Vec<EventSink> {
        self.subscriptions
            .values()
            .filter(|s| s.source == source && s.kind == kind)
            .map(|s| s.sink.clone())
            .collect()
    }

    fn children_of(&self, parent: ObjectHandle) -> Vec<ObjectHandle> {
        self.objects
            .iter()
            .filter(|(_, o)| o.parent == Some(parent))
            .map(|(h, _)| *h)
            .collect()
    }

    fn find(&self, uuid: Uuid, pick: impl Fn(&ObjectKind) -> bool) -> Option<ObjectHandle> {
        let mut matches: Vec<_> = self
            .objects
            .iter()
            .filter(|(_, o)| o.uuid == uuid && pick(&o.kind))
            .map(|(h, _)| *h)
            .collect();
        matches.sort();
        matches.into_iter().next()
    }
}

/// Hardware-free [`GattPlatform`] that can also impersonate remote centrals
#[derive(Debug)]
pub struct SimulatedPlatform {
    state: Mutex<SimState>,
    responded: Notify,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new(RadioState::On)
    }
}

impl SimulatedPlatform {
    pub fn new(radio: RadioState) -> Self {
        Self {
            state: Mutex::new(SimState {
                next_id: 0,
                radio,
                radio_watchers: HashMap::new(),
                objects: HashMap::new(),
                subscriptions: HashMap::new(),
                subscribe_calls: 0,
                unsubscribe_calls: 0,
                subscribers: HashMap::new(),
                pending: HashSet::new(),
                responses: HashMap::new(),
                duplicate_responses: 0,
                notifications: Vec::new(),
                advertising: HashMap::new(),
                failing_releases: HashSet::new(),
                failing_creates: HashSet::new(),
                dangling_releases: 0,
            }),
            responded: Notify::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Adapter and failure injection
    // ------------------------------------------------------------------------

    /// Change the adapter state and tell every radio watcher
    pub fn set_radio_state(&self, radio: RadioState) {
        let watchers: Vec<EventSink> = {
            let mut state = self.state.lock();
            state.radio = radio;
            state.radio_watchers.values().cloned().collect()
        };
        for sink in watchers {
            sink.deliver(PlatformEvent::RadioStateChanged(radio));
        }
    }

    /// Make releasing the provider of `service_uuid` fail
    pub fn fail_release_of(&self, service_uuid: &str) {
        if let Ok(uuid) = parse_uuid(service_uuid) {
            self.state.lock().failing_releases.insert(uuid);
        }
    }

    /// Make creating any object with this uuid fail
    pub fn fail_create_of(&self, uuid: &str) {
        if let Ok(uuid) = parse_uuid(uuid) {
            self.state.lock().failing_creates.insert(uuid);
        }
    }

    // ------------------------------------------------------------------------
    // Object lookup
    // ------------------------------------------------------------------------

    pub fn service_handle(&self, uuid: &str) -> Option<ObjectHandle> {
        let uuid = parse_uuid(uuid).ok()?;
        self.state
            .lock()
            .find(uuid, |k| matches!(k, ObjectKind::ServiceProvider))
    }

    pub fn characteristic_handle(&self, uuid: &str) -> Option<ObjectHandle> {
        let uuid = parse_uuid(uuid).ok()?;
        self.state
            .lock()
            .find(uuid, |k| matches!(k, ObjectKind::Characteristic(_)))
    }

    pub fn descriptor_handle(&self, characteristic_uuid: &str, uuid: &str) -> Option<ObjectHandle> {
        let parent = self.characteristic_handle(characteristic_uuid)?;
        let uuid = parse_uuid(uuid).ok()?;
        let state = self.state.lock();
        let mut matches: Vec<_> = state
            .objects
            .iter()
            .filter(|(_, o)| {
                o.uuid == uuid && o.parent == Some(parent) && matches!(o.kind, ObjectKind::Descriptor)
            })
            .map(|(h, _)| *h)
            .collect();
        matches.sort();
        matches.into_iter().next()
    }

    pub fn characteristic_parameters(&self, handle: ObjectHandle) -> Option<CharacteristicParameters> {
        match self.state.lock().objects.get(&handle).map(|o| &o.kind) {
            Some(ObjectKind::Characteristic(params)) => Some(params.clone()),
            _ => None,
        }
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    // ------------------------------------------------------------------------
    // Remote central impersonation
    // ------------------------------------------------------------------------

    /// Raise a read request from `client` against `handle`
    pub fn read(&self, handle: ObjectHandle, client: &str, encrypted: bool) -> RequestId {
        let (request, sinks) = {
            let mut state = self.state.lock();
            let request = RequestId(state.next());
            state.pending.insert(request);
            (request, state.sinks_for(handle, EventKind::ReadRequested))
        };
        for sink in sinks {
            sink.deliver(PlatformEvent::ReadRequested {
                source: handle,
                request,
                link: LinkInfo {
                    client: ClientToken::new(client),
                    encrypted,
                },
            });
        }
        request
    }

    /// Raise a write request; returns `None` for write-without-response
    pub fn write(
        &self,
        handle: ObjectHandle,
        client: &str,
        value: &[u8],
        encrypted: bool,
        with_response: bool,
    ) -> Option<RequestId> {
        let (request, sinks) = {
            let mut state = self.state.lock();
            let request = if with_response {
                let request = RequestId(state.next());
                state.pending.insert(request);
                Some(request)
            } else {
                None
            };
            (request, state.sinks_for(handle, EventKind::WriteRequested))
        };
        for sink in sinks {
            sink.deliver(PlatformEvent::WriteRequested {
                source: handle,
                request,
                link: LinkInfo {
                    client: ClientToken::new(client),
                    encrypted,
                },
                value: value.to_vec(),
            });
        }
        request
    }

    /// A central enables notifications/indications on `handle`
    pub fn subscribe_client(&self, handle: ObjectHandle, client: &str) {
        let sinks = {
            let mut state = self.state.lock();
            let clients = state.subscribers.entry(handle).or_default();
            let token = ClientToken::new(client);
            if !clients.contains(&token) {
                clients.push(token);
            }
            state.sinks_for(handle, EventKind::SubscribedClientsChanged)
        };
        for sink in sinks {
            sink.deliver(PlatformEvent::SubscribedClientsChanged { source: handle });
        }
    }

    /// A central disables notifications/indications on `handle`
    pub fn unsubscribe_client(&self, handle: ObjectHandle, client: &str) {
        let sinks = {
            let mut state = self.state.lock();
            if let Some(clients) = state.subscribers.get_mut(&handle) {
                clients.retain(|c| c.as_str() != client);
            }
            state.sinks_for(handle, EventKind::SubscribedClientsChanged)
        };
        for sink in sinks {
            sink.deliver(PlatformEvent::SubscribedClientsChanged { source: handle });
        }
    }

    /// Report an advertisement transition the way the stack would
    pub fn raise_advertisement_status(
        &self,
        provider: ObjectHandle,
        status: AdvertisementStatus,
        error: Option<&str>,
    ) {
        let sinks = {
            let mut state = self.state.lock();
            if status.is_terminal() {
                state.advertising.remove(&provider);
            }
            state.sinks_for(provider, EventKind::AdvertisementStatusChanged)
        };
        for sink in sinks {
            sink.deliver(PlatformEvent::AdvertisementStatusChanged {
                source: provider,
                status,
                error: error.map(str::to_string),
            });
        }
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn response(&self, request: RequestId) -> Option<GattResponse> {
        self.state.lock().responses.get(&request).cloned()
    }

    /// Wait until `request` is completed, or give up after `timeout`
    pub async fn wait_for_response(
        &self,
        request: RequestId,
        timeout: Duration,
    ) -> Option<GattResponse> {
        let wait = async {
            loop {
                let notified = self.responded.notified();
                if let Some(response) = self.response(request) {
                    return response;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }

    pub fn pending_requests(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn duplicate_responses(&self) -> usize {
        self.state.lock().duplicate_responses
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.state.lock().notifications.clone()
    }

    /// Attribute event subscriptions currently registered (radio watches excluded)
    pub fn live_subscriptions(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// `(subscribe, unsubscribe)` call counts for attribute events
    pub fn subscription_calls(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.subscribe_calls, state.unsubscribe_calls)
    }

    pub fn radio_watchers(&self) -> usize {
        self.state.lock().radio_watchers.len()
    }

    /// Providers released while some of their objects still had live subscriptions
    pub fn dangling_releases(&self) -> usize {
        self.state.lock().dangling_releases
    }

    pub fn is_advertising(&self, provider: ObjectHandle) -> bool {
        self.state.lock().advertising.contains_key(&provider)
    }

    pub fn advertising_parameters(&self, provider: ObjectHandle) -> Option<AdvertisingParameters> {
        self.state.lock().advertising.get(&provider).cloned()
    }

    pub fn advertising_count(&self) -> usize {
        self.state.lock().advertising.len()
    }
}

impl GattPlatform for SimulatedPlatform {
    fn radio_state(&self) -> RadioState {
        self.state.lock().radio
    }

    fn watch_radio(&self, sink: EventSink) -> Result<EventToken, PlatformError> {
        let mut state = self.state.lock();
        let token = EventToken(state.next());
        state.radio_watchers.insert(token, sink);
        Ok(token)
    }

    fn create_service_provider(&self, uuid: Uuid) -> Result<ObjectHandle, PlatformError> {
        let mut state = self.state.lock();
        if !state.radio.is_present() {
            return Err(PlatformError::RadioUnavailable("no adapter".to_string()));
        }
        if state.failing_creates.contains(&uuid) {
            return Err(PlatformError::Rejected(format!("cannot create service {uuid}")));
        }
        let handle = ObjectHandle(state.next());
        state.objects.insert(
            handle,
            SimObject {
                kind: ObjectKind::ServiceProvider,
                uuid,
                parent: None,
            },
        );
        Ok(handle)
    }

    fn create_characteristic(
        &self,
        service: ObjectHandle,
        params: &CharacteristicParameters,
    ) -> Result<ObjectHandle, PlatformError> {
        let mut state = self.state.lock();
        match state.objects.get(&service).map(|o| &o.kind) {
            Some(ObjectKind::ServiceProvider) => {}
            _ => return Err(PlatformError::UnknownObject(service)),
        }
        if state.failing_creates.contains(&params.uuid) {
            return Err(PlatformError::Rejected(format!(
                "cannot create characteristic {}",
                params.uuid
            )));
        }
        let handle = ObjectHandle(state.next());
        state.objects.insert(
            handle,
            SimObject {
                kind: ObjectKind::Characteristic(params.clone()),
                uuid: params.uuid,
                parent: Some(service),
            },
        );
        Ok(handle)
    }

    fn create_descriptor(
        &self,
        characteristic: ObjectHandle,
        params: &DescriptorParameters,
    ) -> Result<ObjectHandle, PlatformError> {
        let mut state = self.state.lock();
        match state.objects.get(&characteristic).map(|o| &o.kind) {
            Some(ObjectKind::Characteristic(_)) => {}
            _ => return Err(PlatformError::UnknownObject(characteristic)),
        }
        if state.failing_creates.contains(&params.uuid) {
            return Err(PlatformError::Rejected(format!(
                "cannot create descriptor {}",
                params.uuid
            )));
        }
        let handle = ObjectHandle(state.next());
        state.objects.insert(
            handle,
            SimObject {
                kind: ObjectKind::Descriptor,
                uuid: params.uuid,
                parent: Some(characteristic),
            },
        );
        Ok(handle)
    }

    fn subscribe(
        &self,
        source: ObjectHandle,
        kind: EventKind,
        sink: EventSink,
    ) -> Result<EventToken, PlatformError> {
        let mut state = self.state.lock();
        let object_kind = state
            .objects
            .get(&source)
            .map(|o| o.kind.clone())
            .ok_or(PlatformError::UnknownObject(source))?;

        let supported = match object_kind {
            ObjectKind::ServiceProvider => kind == EventKind::AdvertisementStatusChanged,
            ObjectKind::Characteristic(_) => matches!(
                kind,
                EventKind::ReadRequested
                    | EventKind::WriteRequested
                    | EventKind::SubscribedClientsChanged
            ),
            ObjectKind::Descriptor => {
                matches!(kind, EventKind::ReadRequested | EventKind::WriteRequested)
            }
        };
        if !supported {
            return Err(PlatformError::Rejected(format!(
                "{source} does not raise {kind}"
            )));
        }

        let token = EventToken(state.next());
        state
            .subscriptions
            .insert(token, Subscription { source, kind, sink });
        state.subscribe_calls += 1;
        Ok(token)
    }

    fn unsubscribe(&self, token: EventToken) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        if state.subscriptions.remove(&token).is_some() {
            state.unsubscribe_calls += 1;
            return Ok(());
        }
        if state.radio_watchers.remove(&token).is_some() {
            return Ok(());
        }
        Err(PlatformError::UnknownToken(token))
    }

    fn release_service_provider(&self, service: ObjectHandle) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        let uuid = match state.objects.get(&service) {
            Some(SimObject {
                kind: ObjectKind::ServiceProvider,
                uuid,
                ..
            }) => *uuid,
            _ => return Err(PlatformError::UnknownObject(service)),
        };
        if state.failing_releases.contains(&uuid) {
            return Err(PlatformError::Rejected(format!("cannot release service {uuid}")));
        }

        let mut doomed = vec![service];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let children = state.children_of(doomed[cursor]);
            doomed.extend(children);
            cursor += 1;
        }

        if state
            .subscriptions
            .values()
            .any(|s| doomed.contains(&s.source))
        {
            state.dangling_releases += 1;
        }

        for handle in &doomed {
            state.objects.remove(handle);
            state.subscribers.remove(handle);
        }
        state.advertising.remove(&service);
        Ok(())
    }

    fn subscribed_clients(&self, characteristic: ObjectHandle) -> Vec<ClientToken> {
        self.state
            .lock()
            .subscribers
            .get(&characteristic)
            .cloned()
            .unwrap_or_default()
    }

    fn notify(
        &self,
        characteristic: ObjectHandle,
        value: &[u8],
        client: Option<&ClientToken>,
    ) -> Result<usize, PlatformError> {
        let mut state = self.state.lock();
        if !state.objects.contains_key(&characteristic) {
            return Err(PlatformError::UnknownObject(characteristic));
        }
        let subscribers = state
            .subscribers
            .get(&characteristic)
            .cloned()
            .unwrap_or_default();

        let targets: Vec<ClientToken> = match client {
            Some(client) if subscribers.contains(client) => vec![client.clone()],
            Some(client) => {
                return Err(PlatformError::Rejected(format!(
                    "{client} is not subscribed to {characteristic}"
                )))
            }
            None => subscribers,
        };

        for target in &targets {
            state.notifications.push(Notification {
                characteristic,
                client: target.clone(),
                value: value.to_vec(),
            });
        }
        Ok(targets.len())
    }

    fn respond(&self, request: RequestId, response: GattResponse) -> Result<(), PlatformError> {
        {
            let mut state = self.state.lock();
            if !state.pending.remove(&request) {
                if state.responses.contains_key(&request) {
                    state.duplicate_responses += 1;
                    return Err(PlatformError::Rejected(format!(
                        "{request} already completed"
                    )));
                }
                return Err(PlatformError::UnknownRequest(request));
            }
            state.responses.insert(request, response);
        }
        self.responded.notify_waiters();
        Ok(())
    }

    fn start_advertising(
        &self,
        service: ObjectHandle,
        params: &AdvertisingParameters,
    ) -> Result<(), PlatformError> {
        let sinks = {
            let mut state = self.state.lock();
            if state.radio != RadioState::On {
                return Err(PlatformError::RadioUnavailable(format!(
                    "radio is {}",
                    state.radio
                )));
            }
            if !matches!(
                state.objects.get(&service).map(|o| &o.kind),
                Some(ObjectKind::ServiceProvider)
            ) {
                return Err(PlatformError::UnknownObject(service));
            }
            state.advertising.insert(service, params.clone());
            state.sinks_for(service, EventKind::AdvertisementStatusChanged)
        };
        for sink in sinks {
            sink.deliver(PlatformEvent::AdvertisementStatusChanged {
                source: service,
                status: AdvertisementStatus::Started,
                error: None,
            });
        }
        Ok(())
    }

    fn stop_advertising(&self, service: ObjectHandle) -> Result<(), PlatformError> {
        let sinks = {
            let mut state = self.state.lock();
            if state.advertising.remove(&service).is_none() {
                return Ok(());
            }
            state.sinks_for(service, EventKind::AdvertisementStatusChanged)
        };
        for sink in sinks {
            sink.deliver(PlatformEvent::AdvertisementStatusChanged {
                source: service,
                status: AdvertisementStatus::Stopped,
                error: None,
            });
        }
        Ok(())
    }
}
