//! Credential suppliers.
//!
//! The provider asks its supplier for a token on every connection attempt,
//! so a refreshed credential is picked up without rebuilding the session.

use crate::error::SyncError;
use async_trait::async_trait;
use std::future::Future;

/// Source of bearer tokens for the channel handshake.
#[async_trait]
pub trait CredentialSupplier: Send + Sync + 'static {
    /// Fetch a token for one attempt. Returning
    /// [`SyncError::AuthenticationFailure`] stops all reconnects.
    async fn token(&self) -> Result<String, SyncError>;
}

/// A fixed token.
#[derive(Clone, Debug)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl CredentialSupplier for StaticToken {
    async fn token(&self) -> Result<String, SyncError> {
        Ok(self.0.clone())
    }
}

/// Supplier backed by an async closure.
pub struct FnSupplier<F> {
    f: F,
}

/// Wrap an async closure as a [`CredentialSupplier`].
pub fn supplier_fn<F, Fut>(f: F) -> FnSupplier<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, SyncError>> + Send + 'static,
{
    FnSupplier { f }
}

#[async_trait]
impl<F, Fut> CredentialSupplier for FnSupplier<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, SyncError>> + Send + 'static,
{
    async fn token(&self) -> Result<String, SyncError> {
        (self.f)().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_static_token() {
        let supplier = StaticToken::new("secret");
        assert_eq!(supplier.token().await.unwrap(), "secret");
    }

    #[tokio::test]
    async fn test_fn_supplier_is_called_every_time() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let supplier = supplier_fn(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(format!("token-{}", n)) }
        });

        assert_eq!(supplier.token().await.unwrap(), "token-0");
        assert_eq!(supplier.token().await.unwrap(), "token-1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
