// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The registry of websocket operations.
//!
//! A migration source and its action-script sub-operation are both
//! operations: addressable by id, carrying one or more single-use channel
//! secrets, and fed upgraded websockets by the HTTP layer. The registry
//! routes an upgrade on `/1.0/operations/{id}/websocket` to the right
//! instance; everything past the upgrade is the operation's business.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;

use hyper::upgrade::Upgraded;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::migrate::MigrateError;

/// An operation that accepts upgraded websockets.
pub trait WebsocketOperation: Send + Sync {
    /// Validates a secret before the protocol upgrade happens, so a bad
    /// one is refused as a plain HTTP error. A secret that matches
    /// nothing (or was already used) fails with
    /// [`MigrateError::Permission`].
    fn check_secret(&self, secret: &str) -> Result<(), MigrateError>;

    /// Attaches an upgraded socket. Revalidates the secret: another
    /// connection may have raced in since [`Self::check_secret`].
    fn connect(
        &self,
        secret: &str,
        ws: WebSocketStream<Upgraded>,
    ) -> Result<(), MigrateError>;
}

#[derive(Default)]
pub struct Operations {
    inner: Mutex<HashMap<Uuid, Arc<dyn WebsocketOperation>>>,
}

impl Operations {
    pub fn new() -> Operations {
        Operations::default()
    }

    /// Registers an operation under a fresh id.
    pub fn insert(&self, op: Arc<dyn WebsocketOperation>) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().unwrap().insert(id, op);
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<dyn WebsocketOperation>> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &Uuid) {
        self.inner.lock().unwrap().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NopOperation;

    impl WebsocketOperation for NopOperation {
        fn check_secret(&self, _secret: &str) -> Result<(), MigrateError> {
            Ok(())
        }

        fn connect(
            &self,
            _secret: &str,
            _ws: WebSocketStream<Upgraded>,
        ) -> Result<(), MigrateError> {
            Ok(())
        }
    }

    #[test]
    fn registry_lifecycle() {
        let ops = Operations::new();
        let id = ops.insert(Arc::new(NopOperation));
        assert!(ops.get(&id).is_some());
        assert!(ops.get(&Uuid::new_v4()).is_none());
        ops.remove(&id);
        assert!(ops.get(&id).is_none());
    }
}
