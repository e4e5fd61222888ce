//! Session credentials and the holder that shares them between fetches

use super::error::{RateError, RateResult};
use crate::store::KeyValueCollection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

/// A cookie set harvested from a browser session.
///
/// The source publishes no lifetime for its session, so `expires_hint` is
/// informational; a credential is only replaced once the source rejects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub cookies: Vec<Cookie>,
    pub acquired_at: DateTime<Utc>,
    pub expires_hint: Option<DateTime<Utc>>,
}

impl Credential {
    /// Value for an HTTP `Cookie` header.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn missing_cookies<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|name| !self.cookies.iter().any(|c| &c.name == *name))
            .map(String::as_str)
            .collect()
    }

    pub fn past_expiry_hint(&self, now: DateTime<Utc>) -> bool {
        self.expires_hint.is_some_and(|hint| now >= hint)
    }
}

#[async_trait]
pub trait CredentialAcquirer: Send + Sync {
    /// Drives a browser session to the source and harvests its cookies.
    async fn acquire(&self) -> RateResult<Credential>;
}

/// Owns the shared credential.
///
/// Readers get an `Arc` snapshot; replacement is serialized so that a burst of
/// rejections triggers one browser launch, and fetches already running keep
/// the credential they started with.
pub struct CredentialStore {
    acquirer: Arc<dyn CredentialAcquirer>,
    current: RwLock<Option<Arc<Credential>>>,
    writer: Mutex<()>,
    collection: Option<Arc<dyn KeyValueCollection>>,
    identity: String,
}

impl CredentialStore {
    pub fn new(acquirer: Arc<dyn CredentialAcquirer>, identity: impl Into<String>) -> Self {
        Self {
            acquirer,
            current: RwLock::new(None),
            writer: Mutex::new(()),
            collection: None,
            identity: identity.into(),
        }
    }

    /// Like [`CredentialStore::new`], restoring and persisting the credential
    /// in `collection` under the source identity.
    pub fn with_persistence(
        acquirer: Arc<dyn CredentialAcquirer>,
        identity: impl Into<String>,
        collection: Arc<dyn KeyValueCollection>,
    ) -> Self {
        let mut store = Self::new(acquirer, identity);
        match collection.get(&store.identity) {
            Ok(Some(bytes)) => match serde_json::from_slice::<Credential>(&bytes) {
                Ok(credential) => {
                    debug!(
                        identity = %store.identity,
                        acquired_at = %credential.acquired_at,
                        "Restored saved credential"
                    );
                    store.current = RwLock::new(Some(Arc::new(credential)));
                }
                Err(e) => warn!(error = %e, "Ignoring unreadable saved credential"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to read saved credential"),
        }
        store.collection = Some(collection);
        store
    }

    /// Seeds the holder with an existing credential.
    pub fn with_credential(self, credential: Credential) -> Self {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(credential));
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The current credential, if one has been acquired.
    pub fn peek(&self) -> Option<Arc<Credential>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The current credential, acquiring one on first use.
    pub async fn current(&self) -> RateResult<Arc<Credential>> {
        if let Some(credential) = self.peek() {
            if credential.past_expiry_hint(Utc::now()) {
                debug!("Credential is past its expiry hint, using it until rejected");
            }
            return Ok(credential);
        }

        let _guard = self.writer.lock().await;
        if let Some(credential) = self.peek() {
            return Ok(credential);
        }
        info!(identity = %self.identity, "No credential available, acquiring one");
        self.acquire_and_swap().await
    }

    /// Replaces `rejected` with a freshly acquired credential.
    ///
    /// If another caller already replaced it, the newer credential is returned
    /// without acquiring again.
    pub async fn replace(&self, rejected: &Arc<Credential>) -> RateResult<Arc<Credential>> {
        let _guard = self.writer.lock().await;
        if let Some(current) = self.peek() {
            if !Arc::ptr_eq(&current, rejected) {
                debug!("Credential already replaced by another fetch");
                return Ok(current);
            }
        }
        info!(identity = %self.identity, "Replacing rejected credential");
        self.acquire_and_swap().await
    }

    /// Acquires a new credential regardless of the current one.
    pub async fn refresh(&self) -> RateResult<Arc<Credential>> {
        let _guard = self.writer.lock().await;
        self.acquire_and_swap().await
    }

    // Callers must hold `writer`.
    async fn acquire_and_swap(&self) -> RateResult<Arc<Credential>> {
        let credential = match self.acquirer.acquire().await {
            Ok(credential) => credential,
            Err(first) => {
                warn!(error = %first, "Credential acquisition failed, retrying once");
                self.acquirer.acquire().await?
            }
        };

        if let Some(collection) = &self.collection {
            let saved = serde_json::to_vec(&credential)
                .map_err(|e| RateError::Storage(e.to_string()))
                .and_then(|bytes| {
                    collection
                        .put(&self.identity, &bytes)
                        .map_err(|e| RateError::Storage(e.to_string()))
                });
            if let Err(e) = saved {
                warn!(error = %e, "Failed to persist credential");
            }
        }

        let credential = Arc::new(credential);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&credential));
        info!(
            cookies = credential.cookies.len(),
            expires_hint = ?credential.expires_hint,
            "Acquired new credential"
        );
        Ok(credential)
    }
}
