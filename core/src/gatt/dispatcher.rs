//! Platform event routing
//!
//! Two halves:
//! - [`EventSubscriber`] registers the event families the core listens to on
//!   each platform object and revokes them again on removal.
//! - [`EventDispatcher`] is the worker draining the event channel. It resolves
//!   the originating attribute and hands the event to that attribute's lane: a
//!   queue plus task of its own. Events for one attribute are handled in
//!   arrival order; a slow application handler only holds up its own lane.
//!
//! Events whose source no longer resolves (service removed mid-flight) are
//! rejected with `UnlikelyError` and never reach the server core.

use super::registry::ServiceRegistry;
use super::server::GattServerCore;
use crate::platform::{
    DispatchMessage, EventKind, EventSink, EventToken, GattPlatform, ObjectHandle, PlatformError,
    PlatformEvent,
};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Events every characteristic is subscribed to
pub const CHARACTERISTIC_EVENTS: [EventKind; 3] = [
    EventKind::ReadRequested,
    EventKind::WriteRequested,
    EventKind::SubscribedClientsChanged,
];

/// Events every descriptor is subscribed to
pub const DESCRIPTOR_EVENTS: [EventKind; 2] = [EventKind::ReadRequested, EventKind::WriteRequested];

/// Events every service provider is subscribed to
pub const SERVICE_EVENTS: [EventKind; 1] = [EventKind::AdvertisementStatusChanged];

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

/// Registers and revokes platform event subscriptions, all feeding one sink
#[derive(Clone)]
pub struct EventSubscriber {
    platform: Arc<dyn GattPlatform>,
    sink: EventSink,
}

impl EventSubscriber {
    pub fn new(platform: Arc<dyn GattPlatform>, sink: EventSink) -> Self {
        Self { platform, sink }
    }

    /// Subscribe `source` to each of `kinds`, pushing tokens as they are
    /// issued so a caller can roll back after a partial failure
    pub fn subscribe(
        &self,
        source: ObjectHandle,
        kinds: &[EventKind],
        tokens: &mut Vec<EventToken>,
    ) -> Result<(), PlatformError> {
        for &kind in kinds {
            let token = self.platform.subscribe(source, kind, self.sink.clone())?;
            debug!("Subscribed {} to {} ({})", source, kind, token);
            tokens.push(token);
        }
        Ok(())
    }

    /// Revoke every token, continuing past failures
    pub fn revoke(&self, tokens: &[EventToken]) -> Vec<(EventToken, PlatformError)> {
        let mut failures = Vec::new();
        for &token in tokens {
            if let Err(e) = self.platform.unsubscribe(token) {
                warn!("Failed to revoke {}: {}", token, e);
                failures.push((token, e));
            }
        }
        failures
    }

    /// Tell the dispatcher the given objects are gone
    pub fn retire(&self, handles: Vec<ObjectHandle>) {
        if !handles.is_empty() && !self.sink.retire(handles) {
            debug!("Dispatcher already stopped; nothing to retire");
        }
    }

    pub fn shutdown(&self) {
        let _ = self.sink.shutdown();
    }
}

impl std::fmt::Debug for EventSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscriber").finish_non_exhaustive()
    }
}

// ============================================================================
// DISPATCH WORKER
// ============================================================================

pub struct EventDispatcher {
    registry: Arc<ServiceRegistry>,
    server: Arc<GattServerCore>,
    lanes: HashMap<ObjectHandle, mpsc::UnboundedSender<PlatformEvent>>,
}

impl EventDispatcher {
    pub fn new(registry: Arc<ServiceRegistry>, server: Arc<GattServerCore>) -> Self {
        Self {
            registry,
            server,
            lanes: HashMap::new(),
        }
    }

    /// Drain `rx` until shutdown or until every sender is gone
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DispatchMessage>) {
        info!("Event dispatcher started");
        while let Some(message) = rx.recv().await {
            match message {
                DispatchMessage::Platform(PlatformEvent::RadioStateChanged(state)) => {
                    self.server.handle_radio_state(state);
                }
                DispatchMessage::Platform(event) => self.route(event),
                DispatchMessage::Retire(handles) => {
                    for handle in handles {
                        if self.lanes.remove(&handle).is_some() {
                            debug!("Retired lane for {}", handle);
                        }
                    }
                }
                DispatchMessage::Shutdown => break,
            }
        }
        self.lanes.clear();
        info!("Event dispatcher stopped");
    }

    fn route(&mut self, event: PlatformEvent) {
        let Some(source) = event.source() else {
            return;
        };

        if !self.registry.is_live(source) {
            self.server.reject_unresolved(event);
            return;
        }

        let lane = match self.lanes.get(&source) {
            Some(lane) => lane.clone(),
            None => {
                let lane = spawn_lane(source, self.registry.clone(), self.server.clone());
                self.lanes.insert(source, lane.clone());
                lane
            }
        };

        if let Err(mpsc::error::SendError(event)) = lane.send(event) {
            warn!("Lane for {} is gone; rejecting event", source);
            self.lanes.remove(&source);
            self.server.reject_unresolved(event);
        }
    }
}

fn spawn_lane(
    source: ObjectHandle,
    registry: Arc<ServiceRegistry>,
    server: Arc<GattServerCore>,
) -> mpsc::UnboundedSender<PlatformEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PlatformEvent>();
    debug!("Opening lane for {}", source);

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(attribute) = registry.resolve(source) else {
                server.reject_unresolved(event);
                continue;
            };

            let handled = AssertUnwindSafe(server.handle_event(attribute, event))
                .catch_unwind()
                .await;
            if handled.is_err() {
                error!("Handler for {} panicked; request answered by its guard", source);
            }
        }
        debug!("Lane for {} closed", source);
    });

    tx
}
