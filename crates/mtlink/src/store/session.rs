use async_trait::async_trait;

use super::error::StorageResult;

/// Index of persisted sessions, keyed by phone number.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Whether persisted key material exists for `phone`.
    ///
    /// Anything other than a definite "not found" counts as present.
    async fn exists(&self, phone: &str) -> bool;

    /// Phone numbers (digits only) with a persisted session.
    async fn list(&self) -> StorageResult<Vec<String>>;
}
