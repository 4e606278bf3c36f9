//! Advertising session state
//!
//! At most one advertising session is live. A session covers one or more
//! service providers; each provider reports its own status transitions and
//! the session ends once every provider has reached a terminal state, or when
//! the application stops it. Sessions are numbered so a scheduled timeout only
//! ever stops the session it was scheduled for.

use crate::platform::{
    AdvertisementStatus, AdvertisingParameters, GattPlatform, ManufacturerData, ObjectHandle,
    PlatformError, RadioState,
};
use crate::PeripheralError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the application asks for when starting to advertise
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisingRequest {
    /// Services to announce; empty means every primary service
    pub service_ids: Vec<String>,
    pub local_name: Option<String>,
    /// Stop automatically after this long
    pub timeout: Option<Duration>,
    pub manufacturer_data: Option<ManufacturerData>,
    pub include_manufacturer_data_in_scan_response: bool,
}

#[derive(Debug)]
struct Session {
    generation: u64,
    providers: HashMap<ObjectHandle, AdvertisementStatus>,
}

#[derive(Debug, Default)]
struct ControllerState {
    session: Option<Session>,
    generation: u64,
    last_status: Option<AdvertisementStatus>,
}

/// How a reported status affected the live session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    /// The provider is not part of the live session
    Unrelated,
    /// Recorded; the session continues
    Recorded,
    /// Recorded and every provider is now terminal
    SessionEnded,
    /// A stale `Stopped` from an earlier session, ignored
    Stale,
}

pub struct AdvertisingController {
    platform: Arc<dyn GattPlatform>,
    state: Mutex<ControllerState>,
}

impl AdvertisingController {
    pub fn new(platform: Arc<dyn GattPlatform>) -> Self {
        Self {
            platform,
            state: Mutex::new(ControllerState::default()),
        }
    }

    /// Open a session advertising every provider in `targets`.
    /// Returns the session generation.
    pub fn start(
        &self,
        radio: RadioState,
        targets: &[(String, ObjectHandle)],
        params: &AdvertisingParameters,
    ) -> Result<u64, PeripheralError> {
        match radio {
            RadioState::On => {}
            RadioState::Unauthorized => return Err(PeripheralError::PermissionDenied),
            other => {
                return Err(PeripheralError::NotSupported(format!(
                    "cannot advertise while radio is {other}"
                )))
            }
        }

        let mut state = self.state.lock();
        if state.session.is_some() {
            return Err(PeripheralError::AlreadyAdvertising);
        }

        let mut started: Vec<ObjectHandle> = Vec::with_capacity(targets.len());
        for (id, provider) in targets {
            if let Err(e) = self.platform.start_advertising(*provider, params) {
                warn!("Advertising {} failed: {}; stopping the rest", id, e);
                for handle in &started {
                    if let Err(stop) = self.platform.stop_advertising(*handle) {
                        warn!("Stopping {} after failed start: {}", handle, stop);
                    }
                }
                return Err(e.into());
            }
            debug!("Advertising {} on {}", id, provider);
            started.push(*provider);
        }

        state.generation += 1;
        let generation = state.generation;
        state.session = Some(Session {
            generation,
            providers: started
                .into_iter()
                .map(|handle| (handle, AdvertisementStatus::Created))
                .collect(),
        });
        state.last_status = Some(AdvertisementStatus::Created);
        info!(
            "Advertising session {} started ({} services)",
            generation,
            targets.len()
        );
        Ok(generation)
    }

    /// Stop the live session; nothing to do when none is live
    pub fn stop(&self) -> Result<(), PeripheralError> {
        let session = self.state.lock().session.take();
        match session {
            Some(session) => self.halt(session),
            None => {
                debug!("stop requested with no live advertising session");
                Ok(())
            }
        }
    }

    /// Stop the live session only if it is still `generation`
    pub fn stop_generation(&self, generation: u64) -> Result<bool, PeripheralError> {
        let session = {
            let mut state = self.state.lock();
            match &state.session {
                Some(session) if session.generation == generation => state.session.take(),
                _ => None,
            }
        };
        match session {
            Some(session) => {
                info!("Advertising session {} timed out", generation);
                self.halt(session).map(|_| true)
            }
            None => Ok(false),
        }
    }

    fn halt(&self, session: Session) -> Result<(), PeripheralError> {
        let mut first_failure: Option<PlatformError> = None;
        for provider in session.providers.keys() {
            if let Err(e) = self.platform.stop_advertising(*provider) {
                warn!("Stopping advertisement on {} failed: {}", provider, e);
                first_failure.get_or_insert(e);
            }
        }
        info!("Advertising session {} stopped", session.generation);
        match first_failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Record a status transition reported by `provider`
    pub fn record_status(&self, provider: ObjectHandle, status: AdvertisementStatus) -> StatusOutcome {
        let mut state = self.state.lock();
        let Some(session) = state.session.as_mut() else {
            state.last_status = Some(status);
            return StatusOutcome::Unrelated;
        };
        let Some(current) = session.providers.get_mut(&provider) else {
            return StatusOutcome::Unrelated;
        };

        // A Stopped queued by an earlier session can arrive before this
        // session's Started
        if status == AdvertisementStatus::Stopped && *current == AdvertisementStatus::Created {
            return StatusOutcome::Stale;
        }

        *current = status;
        let ended = session.providers.values().all(|s| s.is_terminal());
        let generation = session.generation;
        state.last_status = Some(status);
        if ended {
            state.session = None;
            info!("Advertising session {} ended ({})", generation, status);
            StatusOutcome::SessionEnded
        } else {
            StatusOutcome::Recorded
        }
    }

    /// A service is going away; take its provider out of the session
    pub fn forget_provider(&self, provider: ObjectHandle) {
        let mut state = self.state.lock();
        let Some(session) = state.session.as_mut() else {
            return;
        };
        if session.providers.remove(&provider).is_none() {
            return;
        }
        if let Err(e) = self.platform.stop_advertising(provider) {
            warn!("Stopping advertisement on {} failed: {}", provider, e);
        }
        if session.providers.is_empty() {
            let generation = session.generation;
            state.session = None;
            state.last_status = Some(AdvertisementStatus::Stopped);
            info!("Advertising session {} ended (no services left)", generation);
        }
    }

    /// The radio went away underneath a live session.
    /// Returns true when a session was dropped.
    pub fn radio_lost(&self) -> bool {
        let session = {
            let mut state = self.state.lock();
            let session = state.session.take();
            if session.is_some() {
                state.last_status = Some(AdvertisementStatus::Aborted);
            }
            session
        };
        let Some(session) = session else {
            return false;
        };
        warn!("Advertising session {} aborted by radio loss", session.generation);
        for provider in session.providers.keys() {
            if let Err(e) = self.platform.stop_advertising(*provider) {
                warn!("Stopping advertisement on {} failed: {}", provider, e);
            }
        }
        true
    }

    pub fn is_advertising(&self) -> bool {
        self.state.lock().session.is_some()
    }

    /// Most recent status transition
    pub fn status(&self) -> Option<AdvertisementStatus> {
        self.state.lock().last_status
    }
}
