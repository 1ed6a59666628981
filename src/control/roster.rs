use crate::protocol::{Tab, TabAction, TabChange};

/// The server's ordered list of tabs, as last seen by this client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    tabs: Vec<Tab>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tabs(tabs: Vec<Tab>) -> Self {
        Self { tabs }
    }

    pub fn tabs(&self) -> &[Tab] {
        &self.tabs
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    pub fn get(&self, tab_id: &str) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.id == tab_id)
    }

    pub fn find_by_session(&self, session_id: &str) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.session_id == session_id)
    }

    /// Look a tab up the way a user would name it: by id, then by name.
    pub fn resolve(&self, key: &str) -> Option<&Tab> {
        self.get(key).or_else(|| self.tabs.iter().find(|t| t.name == key))
    }

    /// Replace everything with a full snapshot.
    pub fn apply_snapshot(&mut self, tabs: Vec<Tab>) {
        self.tabs = tabs;
    }

    /// Apply a delta list in order. Returns whether anything changed.
    pub fn apply_changes(&mut self, changes: Vec<TabChange>) -> bool {
        let mut changed = false;
        for change in changes {
            changed |= self.apply_change(change);
        }
        changed
    }

    fn apply_change(&mut self, change: TabChange) -> bool {
        match change.action {
            TabAction::Remove => {
                let before = self.tabs.len();
                self.tabs.retain(|t| t.id != change.tab_id);
                if self.tabs.len() != before {
                    tracing::debug!(tab_id = %change.tab_id, reason = ?change.reason, "tab removed");
                    true
                } else {
                    false
                }
            }
            TabAction::Add | TabAction::Update => {
                let Some(tab) = change.tab else {
                    tracing::warn!(
                        tab_id = %change.tab_id,
                        action = ?change.action,
                        "roster change without tab payload ignored"
                    );
                    return false;
                };
                match self.tabs.iter_mut().find(|t| t.id == change.tab_id) {
                    Some(existing) => {
                        if *existing == tab {
                            return false;
                        }
                        *existing = tab;
                    }
                    None => self.tabs.push(tab),
                }
                true
            }
        }
    }
}
