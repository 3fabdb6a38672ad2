//! Live sessions keyed by username, plus the join order that defines the roster.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::session::SessionHandle;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("username '{0}' is already taken")]
    DuplicateUsername(String),
}

#[derive(Debug, Default)]
pub struct Registry {
    members: Mutex<Members>,
}

/// Both collections live behind one lock so they can never disagree.
#[derive(Debug, Default)]
struct Members {
    by_name: HashMap<String, SessionHandle>,
    order: Vec<String>,
}

impl Members {
    fn remove(&mut self, username: &str) -> Option<SessionHandle> {
        let removed = self.by_name.remove(username)?;
        self.order.retain(|name| name != username);
        Some(removed)
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session: SessionHandle) -> Result<(), RegistryError> {
        let mut members = self.members.lock().await;
        let username = session.username().to_string();

        if members.by_name.contains_key(&username) {
            return Err(RegistryError::DuplicateUsername(username));
        }

        members.order.push(username.clone());
        members.by_name.insert(username, session);
        Ok(())
    }

    /// Removes `username` if present. Absent names are not an error.
    pub async fn unregister(&self, username: &str) -> Option<SessionHandle> {
        self.members.lock().await.remove(username)
    }

    /// Removes `session` only if it is still the one registered under its name.
    pub async fn retire(&self, session: &SessionHandle) -> bool {
        let mut members = self.members.lock().await;
        let registered = members
            .by_name
            .get(session.username())
            .is_some_and(|current| current.id() == session.id());

        if registered {
            members.remove(session.username());
        }
        registered
    }

    pub async fn lookup(&self, username: &str) -> Option<SessionHandle> {
        self.members.lock().await.by_name.get(username).cloned()
    }

    /// Usernames in join order.
    pub async fn snapshot(&self) -> Vec<String> {
        self.members.lock().await.order.clone()
    }

    /// Sessions in join order, copied under the lock.
    pub async fn members(&self) -> Vec<SessionHandle> {
        let members = self.members.lock().await;
        members
            .order
            .iter()
            .filter_map(|name| members.by_name.get(name).cloned())
            .collect()
    }

    pub async fn members_except(&self, excluded: &str) -> Vec<SessionHandle> {
        let mut sessions = self.members().await;
        sessions.retain(|session| session.username() != excluded);
        sessions
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    #[cfg(test)]
    pub(crate) async fn is_consistent(&self) -> bool {
        let members = self.members.lock().await;
        let mut ordered = members.order.clone();
        ordered.sort();
        let mut keyed: Vec<String> = members.by_name.keys().cloned().collect();
        keyed.sort();
        ordered.dedup();
        ordered.len() == members.order.len() && ordered == keyed
    }
}
