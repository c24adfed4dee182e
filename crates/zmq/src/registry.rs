//! Name to socket mapping.
//!
//! The registry owns the `zmq::Context` and every [`SocketHandle`] created
//! through it. The map is guarded by one mutex that is held only while the
//! map itself changes; bind and connect run on the handle after the lock is
//! released. Removing a socket from the map always closes it.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::debug;

use crate::{
    error::TransferError,
    socket::{SocketHandle, SocketPattern, SocketTuning},
    Result,
};

pub struct SocketRegistry {
    context: zmq::Context,
    sockets: Mutex<HashMap<String, Arc<SocketHandle>>>,
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::with_context(zmq::Context::new())
    }

    pub fn with_context(context: zmq::Context) -> Self {
        Self {
            context,
            sockets: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &zmq::Context {
        &self.context
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<SocketHandle>>> {
        self.sockets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates a socket under `name`, closing any previous socket of that
    /// name first.
    pub fn create(
        &self,
        name: &str,
        pattern: SocketPattern,
        tuning: SocketTuning,
        topics: &[String],
    ) -> Result<Arc<SocketHandle>> {
        let mut sockets = self.map();

        if let Some(previous) = sockets.remove(name) {
            Self::release(&previous);
        }

        let handle = Arc::new(SocketHandle::open(
            &self.context,
            name,
            pattern,
            tuning,
            topics,
        )?);
        sockets.insert(name.to_string(), Arc::clone(&handle));
        debug!(socket = name, %pattern, "Socket created");

        Ok(handle)
    }

    pub fn get(&self, name: &str) -> Result<Arc<SocketHandle>> {
        self.map()
            .get(name)
            .cloned()
            .ok_or_else(|| TransferError::UnknownSocket(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map().contains_key(name)
    }

    pub fn bind(&self, name: &str, endpoint: &str) -> Result<()> {
        self.get(name)?.bind(endpoint)
    }

    pub fn connect(&self, name: &str, endpoint: &str) -> Result<()> {
        self.get(name)?.connect(endpoint)
    }

    /// Removes and closes the socket. Fails with `UnknownSocket` when no
    /// socket has that name.
    pub fn close(&self, name: &str) -> Result<()> {
        let handle = self
            .map()
            .remove(name)
            .ok_or_else(|| TransferError::UnknownSocket(name.to_string()))?;
        Self::release(&handle);
        debug!(socket = name, "Socket closed");
        Ok(())
    }

    /// Closes `handle` and removes it from the map if it is still the socket
    /// registered under its name. A newer socket of the same name is left
    /// alone.
    pub fn discard(&self, handle: &Arc<SocketHandle>) {
        let mut sockets = self.map();
        if sockets
            .get(handle.name())
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            sockets.remove(handle.name());
        }
        drop(sockets);
        Self::release(handle);
    }

    /// Closes every socket and returns how many were closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.map().drain().collect();
        let count = drained.len();
        for (name, handle) in drained {
            Self::release(&handle);
            debug!(socket = %name, "Socket closed");
        }
        count
    }

    fn release(handle: &SocketHandle) {
        if handle.close() {
            debug!(socket = handle.name(), endpoint = ?handle.endpoint(), "Socket released");
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.map().keys().cloned().collect();
        names.sort();
        names
    }

    /// Endpoints of every socket that has been bound or connected.
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<_> = self.map().values().filter_map(|h| h.endpoint()).collect();
        endpoints.sort();
        endpoints.dedup();
        endpoints
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}
