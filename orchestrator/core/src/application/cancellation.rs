// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Cancellation registry for live chat requests.
//!
//! Each request registers a stop token keyed by its [`RequestId`]; the
//! out-of-band stop operation cancels it. The [`Registration`] guard removes
//! the entry on every exit path.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::admission::RequestId;

#[derive(Debug, Default)]
pub struct CancellationRegistry {
    live: DashMap<RequestId, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self {
            live: DashMap::new(),
        }
    }

    pub fn register(self: &Arc<Self>, request_id: RequestId) -> Registration {
        let token = CancellationToken::new();
        self.live.insert(request_id, token.clone());
        debug!(request_id = %request_id, "Registered cancellable request");
        Registration {
            registry: Arc::clone(self),
            request_id,
            token,
        }
    }

    /// Cancels a live request. Returns `false` when nothing is registered
    /// under `request_id`.
    pub fn stop(&self, request_id: RequestId) -> bool {
        match self.live.get(&request_id) {
            Some(entry) => {
                info!(request_id = %request_id, "Stop requested");
                entry.value().cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[derive(Debug)]
pub struct Registration {
    registry: Arc<CancellationRegistry>,
    request_id: RequestId,
    token: CancellationToken,
}

impl Registration {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Token cancelled by [`CancellationRegistry::stop`].
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.live.remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_cancels_registered_token() {
        let registry = Arc::new(CancellationRegistry::new());
        let id = RequestId::new();
        let registration = registry.register(id);
        assert_eq!(registry.len(), 1);
        assert!(registry.stop(id));
        assert!(registration.is_stopped());
        assert!(registration.token().is_cancelled());
    }

    #[test]
    fn test_stop_unknown_request() {
        let registry = Arc::new(CancellationRegistry::new());
        assert!(!registry.stop(RequestId::new()));
    }

    #[test]
    fn test_registration_drop_removes_entry() {
        let registry = Arc::new(CancellationRegistry::new());
        let id = RequestId::new();
        {
            let _registration = registry.register(id);
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
        assert!(!registry.stop(id));
    }

    #[test]
    fn test_stop_targets_one_request() {
        let registry = Arc::new(CancellationRegistry::new());
        let a = registry.register(RequestId::new());
        let b = registry.register(RequestId::new());
        assert!(registry.stop(a.request_id()));
        assert!(a.is_stopped());
        assert!(!b.is_stopped());
    }
}
