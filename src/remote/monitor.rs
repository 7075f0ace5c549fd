//! Reachability and authentication monitors, consumed as traits.
//!
//! Token refresh and credential persistence live inside the auth
//! collaborator; the engine only observes login state and reacts to edges.

use std::sync::Arc;

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("not logged in")]
    LoggedOut,
    #[error("could not persist auth info")]
    CouldNotPersistAuthInfo,
}

pub trait NetworkStateListener: Send + Sync {
    fn on_network_state_changed(&self, connected: bool);
}

pub trait NetworkMonitor: Send + Sync {
    fn is_connected(&self) -> bool;

    fn add_state_listener(&self, listener: Arc<dyn NetworkStateListener>);

    /// Removes a previously registered listener (by identity).
    fn remove_state_listener(&self, listener: &Arc<dyn NetworkStateListener>);
}

pub trait AuthStateListener: Send + Sync {
    fn on_auth_state_changed(&self, logged_in: bool);
}

pub trait AuthMonitor: Send + Sync {
    /// Whether a user session is currently live. Must not block on token
    /// refresh; a refresh in flight reports the last known state.
    fn try_is_logged_in(&self) -> bool;

    fn add_state_listener(&self, listener: Arc<dyn AuthStateListener>);

    fn remove_state_listener(&self, listener: &Arc<dyn AuthStateListener>);
}
