//! Bearer credential handoff from the auth collaborator.
//!
//! How a token is obtained or refreshed is not this crate's concern. The
//! auth layer calls [`CredentialStore::set`] after login and
//! [`CredentialStore::clear`] on logout or after a
//! [`CartEvent::SessionExpired`](crate::cart::CartEvent::SessionExpired).

use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::RwLock;

use crate::error::CartError;

/// Shared slot holding the current bearer credential.
#[derive(Clone, Default)]
pub struct CredentialStore {
    token: Arc<RwLock<Option<SecretString>>>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl CredentialStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `token`.
    #[must_use]
    pub fn with_token(token: SecretString) -> Self {
        Self {
            token: Arc::new(RwLock::new(Some(token))),
        }
    }

    /// Replace the current credential.
    pub async fn set(&self, token: SecretString) {
        *self.token.write().await = Some(token);
    }

    /// Drop the current credential.
    pub async fn clear(&self) {
        *self.token.write().await = None;
    }

    /// Whether a credential is present.
    pub async fn is_present(&self) -> bool {
        self.token.read().await.is_some()
    }

    /// The credential to attach to the next request.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Unauthorized` if no credential is present.
    pub async fn bearer(&self) -> Result<SecretString, CartError> {
        self.token
            .read()
            .await
            .clone()
            .ok_or(CartError::Unauthorized)
    }
}
