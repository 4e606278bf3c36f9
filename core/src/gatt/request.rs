//! Exactly-once request completion
//!
//! Every read request and every write-with-response handed to the core must
//! be answered exactly once. [`PendingRequest`] owns the completion: answering
//! consumes it, and dropping it unanswered (a handler bailed out early, a
//! lane was retired, a callback panicked) answers `UnlikelyError`.

use crate::gatt::model::AttErrorCode;
use crate::platform::{GattPlatform, GattResponse, PlatformError, RequestId};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PendingRequest {
    id: RequestId,
    platform: Arc<dyn GattPlatform>,
    answered: bool,
}

impl PendingRequest {
    pub fn new(id: RequestId, platform: Arc<dyn GattPlatform>) -> Self {
        Self {
            id,
            platform,
            answered: false,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Complete the request with `response`
    pub fn respond(mut self, response: GattResponse) -> Result<(), PlatformError> {
        self.answered = true;
        debug!("Completing {} with {:?}", self.id, response);
        self.platform.respond(self.id, response)
    }

    /// Complete the request with a protocol error
    pub fn reject(self, code: AttErrorCode) -> Result<(), PlatformError> {
        self.respond(GattResponse::Error(code))
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if self.answered {
            return;
        }
        warn!("{} dropped without a response; answering UnlikelyError", self.id);
        if let Err(e) = self
            .platform
            .respond(self.id, GattResponse::Error(AttErrorCode::UnlikelyError))
        {
            warn!("Failed to complete {}: {}", self.id, e);
        }
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("answered", &self.answered)
            .finish()
    }
}
