use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::session::{
    ConnectionState, LocalId, SessionConfig, SessionConnection, SessionError, SessionEvent,
};
use crate::sink::RenderSink;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown session: {0}")]
    UnknownSession(LocalId),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Owns every data-plane connection of the client.
///
/// Connections are addressed by a [`LocalId`] handed out by [`open`], which
/// stays valid across reconnects until the connection is removed or the
/// server rejects its session id.
///
/// [`open`]: ConnectionRegistry::open
pub struct ConnectionRegistry {
    config: SessionConfig,
    connections: HashMap<LocalId, SessionConnection>,
    next_id: LocalId,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl ConnectionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            connections: HashMap::new(),
            next_id: 1,
            events_tx,
            events_rx,
        }
    }

    /// Register a connection for `server_session_id`. It starts disconnected.
    pub fn open(&mut self, server_session_id: impl Into<String>, sink: Box<dyn RenderSink>) -> LocalId {
        let id = self.next_id;
        self.next_id += 1;
        let server_session_id = server_session_id.into();
        tracing::debug!(local_id = id, session_id = %server_session_id, "registering session");
        let conn = SessionConnection::spawn(
            id,
            server_session_id,
            self.config.clone(),
            sink,
            self.events_tx.clone(),
        );
        self.connections.insert(id, conn);
        id
    }

    pub fn connect(&self, id: LocalId, skip_buffer: bool) -> Result<(), RegistryError> {
        Ok(self.get(id)?.connect(skip_buffer)?)
    }

    pub fn disconnect(&self, id: LocalId) -> Result<(), RegistryError> {
        Ok(self.get(id)?.disconnect()?)
    }

    pub fn send_input(&self, id: LocalId, data: impl Into<Bytes>) -> Result<(), RegistryError> {
        Ok(self.get(id)?.send_input(data)?)
    }

    pub fn send_resize(&self, id: LocalId, cols: u16, rows: u16) -> Result<(), RegistryError> {
        Ok(self.get(id)?.send_resize(cols, rows)?)
    }

    pub fn state(&self, id: LocalId) -> Result<ConnectionState, RegistryError> {
        Ok(self.get(id)?.state())
    }

    pub fn find_by_session(&self, server_session_id: &str) -> Option<LocalId> {
        self.connections
            .values()
            .find(|c| c.server_session_id() == server_session_id)
            .map(|c| c.local_id())
    }

    pub fn ids(&self) -> Vec<LocalId> {
        let mut ids: Vec<LocalId> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Disconnect and forget a connection.
    pub async fn remove(&mut self, id: LocalId) -> Result<(), RegistryError> {
        let conn = self
            .connections
            .remove(&id)
            .ok_or(RegistryError::UnknownSession(id))?;
        conn.shutdown().await;
        tracing::debug!(local_id = id, "session removed");
        Ok(())
    }

    /// Next notification from any live connection.
    ///
    /// A connection that reports `Stale` has already been discarded when the
    /// event is returned. Events from connections removed in the meantime are
    /// skipped. Returns `None` only if the registry's own channel closed.
    ///
    /// Cancel-safe: the only await is the channel receive.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            let event = self.events_rx.recv().await?;
            let id = event.local_id();
            if !self.connections.contains_key(&id) {
                tracing::trace!(local_id = id, "dropping event from removed session");
                continue;
            }
            if let SessionEvent::Stale { code, .. } = &event {
                tracing::info!(local_id = id, code, "discarding stale session");
                if let Some(conn) = self.connections.remove(&id) {
                    tokio::spawn(conn.shutdown());
                }
            }
            return Some(event);
        }
    }

    /// Disconnect everything and wait for all drivers to stop.
    pub async fn shutdown(&mut self) {
        let conns: Vec<SessionConnection> = self.connections.drain().map(|(_, c)| c).collect();
        futures::future::join_all(conns.into_iter().map(|c| c.shutdown())).await;
    }

    fn get(&self, id: LocalId) -> Result<&SessionConnection, RegistryError> {
        self.connections.get(&id).ok_or(RegistryError::UnknownSession(id))
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}
