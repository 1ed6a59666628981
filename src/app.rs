//! Tabs on the server joined with data-plane connections on this client.

use std::collections::HashMap;

use tokio_stream::wrappers::WatchStream;

use crate::control::{ControlChannel, ControlError, Roster};
use crate::protocol::Tab;
use crate::registry::{ConnectionRegistry, RegistryError};
use crate::session::{LocalId, SessionEvent};
use crate::sink::RenderSink;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("no such tab: {0}")]
    UnknownTab(String),
}

/// What [`plan_sync`] wants done to bring local connections in line with
/// the roster.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Tabs with no local connection yet.
    pub open: Vec<Tab>,
    /// Local connections whose tab is gone: (tab id, local id).
    pub remove: Vec<(String, LocalId)>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.open.is_empty() && self.remove.is_empty()
    }
}

/// Diff the roster against the known `tab_id -> local_id` map.
pub fn plan_sync(roster: &Roster, known: &HashMap<String, LocalId>) -> SyncPlan {
    let open = roster
        .tabs()
        .iter()
        .filter(|t| !known.contains_key(&t.id))
        .cloned()
        .collect();

    let mut remove: Vec<(String, LocalId)> = known
        .iter()
        .filter(|(tab_id, _)| roster.get(tab_id).is_none())
        .map(|(tab_id, id)| (tab_id.clone(), *id))
        .collect();
    remove.sort_by_key(|(_, id)| *id);

    SyncPlan { open, remove }
}

type SinkFactory = Box<dyn Fn(&Tab) -> Box<dyn RenderSink> + Send + Sync>;

pub struct Workspace {
    control: ControlChannel,
    registry: ConnectionRegistry,
    tabs: HashMap<String, LocalId>,
    make_sink: SinkFactory,
}

impl Workspace {
    /// `make_sink` builds the render sink for each tab that gets a connection.
    pub fn new<F>(control: ControlChannel, registry: ConnectionRegistry, make_sink: F) -> Self
    where
        F: Fn(&Tab) -> Box<dyn RenderSink> + Send + Sync + 'static,
    {
        Self {
            control,
            registry,
            tabs: HashMap::new(),
            make_sink: Box::new(make_sink),
        }
    }

    pub fn control(&self) -> &ControlChannel {
        &self.control
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn roster(&self) -> Roster {
        self.control.roster()
    }

    /// Roster snapshots as a stream, starting with the current one.
    pub fn roster_updates(&self) -> WatchStream<Roster> {
        WatchStream::new(self.control.watch_roster())
    }

    pub fn local_id(&self, tab_id: &str) -> Option<LocalId> {
        self.tabs.get(tab_id).copied()
    }

    pub fn tab_for(&self, id: LocalId) -> Option<&str> {
        self.tabs
            .iter()
            .find(|(_, local)| **local == id)
            .map(|(tab_id, _)| tab_id.as_str())
    }

    /// Reconcile local connections with the current roster.
    pub async fn sync(&mut self) -> SyncPlan {
        let plan = plan_sync(&self.control.roster(), &self.tabs);
        for tab in &plan.open {
            self.open_tab(tab);
        }
        for (tab_id, id) in &plan.remove {
            self.tabs.remove(tab_id);
            if let Err(e) = self.registry.remove(*id).await {
                tracing::debug!(%tab_id, local_id = id, error = %e, "connection already gone");
            }
        }
        if !plan.is_empty() {
            tracing::debug!(opened = plan.open.len(), removed = plan.remove.len(), "workspace synced");
        }
        plan
    }

    /// Create a tab on the server and register a connection for it.
    pub async fn create_tab(&mut self, shell_id: Option<String>) -> Result<(Tab, LocalId), WorkspaceError> {
        let tab = self.control.create_session(shell_id).await?;
        tracing::info!(tab_id = %tab.id, session_id = %tab.session_id, "tab created");
        let id = self.open_tab(&tab);
        Ok((tab, id))
    }

    pub async fn close_tab(&mut self, key: &str) -> Result<(), WorkspaceError> {
        let tab = self.resolve(key)?;
        self.control.close_session(&tab.id).await?;
        if let Some(id) = self.tabs.remove(&tab.id) {
            self.registry.remove(id).await?;
        }
        tracing::info!(tab_id = %tab.id, "tab closed");
        Ok(())
    }

    pub async fn rename_tab(&mut self, key: &str, name: &str) -> Result<Tab, WorkspaceError> {
        let tab = self.resolve(key)?;
        let updated = self.control.rename_session(&tab.id, name).await?;
        Ok(updated.unwrap_or(Tab { name: name.to_string(), ..tab }))
    }

    /// Connect a tab's data plane, registering it first if needed. A tab
    /// this workspace already holds a connection for is used as is.
    pub fn attach(&mut self, key: &str, skip_buffer: bool) -> Result<LocalId, WorkspaceError> {
        let id = match self.tabs.get(key) {
            Some(id) => *id,
            None => {
                let tab = self.resolve(key)?;
                self.open_tab(&tab)
            }
        };
        self.registry.connect(id, skip_buffer)?;
        Ok(id)
    }

    pub fn send_input(&self, id: LocalId, data: impl Into<bytes::Bytes>) -> Result<(), WorkspaceError> {
        Ok(self.registry.send_input(id, data)?)
    }

    pub fn send_resize(&self, id: LocalId, cols: u16, rows: u16) -> Result<(), WorkspaceError> {
        Ok(self.registry.send_resize(id, cols, rows)?)
    }

    /// Next session notification. Tabs whose connection went stale are
    /// forgotten before the event is returned.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let event = self.registry.next_event().await?;
        if let SessionEvent::Stale { local_id, .. } = &event {
            self.tabs.retain(|_, id| id != local_id);
        }
        Some(event)
    }

    pub async fn shutdown(mut self) {
        self.registry.shutdown().await;
        self.control.shutdown().await;
    }

    fn resolve(&self, key: &str) -> Result<Tab, WorkspaceError> {
        self.control
            .roster()
            .resolve(key)
            .cloned()
            .ok_or_else(|| WorkspaceError::UnknownTab(key.to_string()))
    }

    fn open_tab(&mut self, tab: &Tab) -> LocalId {
        if let Some(id) = self.tabs.get(&tab.id) {
            return *id;
        }
        let id = self.registry.open(tab.session_id.clone(), (self.make_sink)(tab));
        self.tabs.insert(tab.id.clone(), id);
        id
    }
}
