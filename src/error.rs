use thiserror::Error;

use crate::remote::monitor::AuthError;
use crate::remote::RemoteError;
use crate::store::StoreError;
use crate::sync::SyncError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (locally or remotely).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Store(err) => match err {
                StoreError::Backend(_) => Transience::Unknown,
                _ => Transience::Permanent,
            },
            Error::Remote(err) => remote_transience(err),
            Error::Auth(err) => match err {
                AuthError::LoggedOut => Transience::Retryable,
                AuthError::CouldNotPersistAuthInfo => Transience::Unknown,
            },
            Error::Sync(err) => sync_transience(err),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            // Local store failures leave the affected write in doubt.
            Error::Store(StoreError::Backend(_)) => Effect::Unknown,
            Error::Store(_) => Effect::None,
            Error::Remote(RemoteError::Service { .. }) => Effect::Unknown,
            Error::Remote(_) => Effect::None,
            Error::Auth(_) => Effect::None,
            Error::Sync(SyncError::Store(_)) | Error::Sync(SyncError::Remote(_)) => {
                Effect::Unknown
            }
            Error::Sync(_) => Effect::None,
        }
    }
}

fn remote_transience(err: &RemoteError) -> Transience {
    match err {
        RemoteError::NetworkDown
        | RemoteError::LoggedOut
        | RemoteError::Interrupted
        | RemoteError::StreamClosed => Transience::Retryable,
        RemoteError::Service { .. } => Transience::Unknown,
        RemoteError::Decode(_) => Transience::Permanent,
    }
}

fn sync_transience(err: &SyncError) -> Transience {
    match err {
        SyncError::NetworkDown | SyncError::LoggedOut | SyncError::Interrupted => {
            Transience::Retryable
        }
        SyncError::Remote(remote) => remote_transience(remote),
        SyncError::Store(StoreError::Backend(_)) => Transience::Unknown,
        _ => Transience::Permanent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_aborting_errors_are_retryable() {
        for err in [SyncError::NetworkDown, SyncError::LoggedOut, SyncError::Interrupted] {
            assert!(Error::from(err).transience().is_retryable());
        }
    }

    #[test]
    fn version_errors_are_permanent() {
        let err = Error::from(SyncError::UnsupportedProtocolVersion(2));
        assert_eq!(err.transience(), Transience::Permanent);
        assert_eq!(err.effect(), Effect::None);
    }
}
