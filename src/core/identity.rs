//! Stable session identity.
//!
//! The proxy correlates reconnects by a session identifier that survives
//! reboots. The identifier lives in the host's key-value store behind the
//! [`KvStore`] seam; when storage fails the device keeps working with an
//! ephemeral identifier for the life of the process.

use async_trait::async_trait;
use tracing::{info, warn};

/// KV namespace holding the transport identity.
pub const IDENTITY_NAMESPACE: &str = "proxy_client";

/// Key of the persisted session identifier.
pub const SESSION_ID_KEY: &str = "session_id";

/// Maximum identifier length accepted by the store (ASCII).
pub const SESSION_ID_MAX_LEN: usize = 31;

/// Error type for key-value storage operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    #[error("kv storage error: {0}")]
    Storage(String),
}

/// Host key-value storage seam (NVS or equivalent).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, KvError>;
    async fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), KvError>;
}

fn generate_session_id() -> String {
    format!("esp32-{:08x}", rand::random::<u32>())
}

/// Load the persisted session identifier, creating and storing one on
/// first use. Storage failures fall back to an ephemeral identifier.
pub async fn load_or_create_session_id(store: &dyn KvStore) -> String {
    match store.get(IDENTITY_NAMESPACE, SESSION_ID_KEY).await {
        Ok(Some(id)) if !id.is_empty() && id.len() <= SESSION_ID_MAX_LEN => {
            info!("loaded session id: {}", id);
            return id;
        }
        Ok(Some(id)) => {
            warn!("stored session id invalid ({} chars); regenerating", id.len());
        }
        Ok(None) => {}
        Err(e) => {
            warn!("session id lookup failed: {}; using ephemeral id", e);
            return generate_session_id();
        }
    }

    let id = generate_session_id();
    match store.set(IDENTITY_NAMESPACE, SESSION_ID_KEY, &id).await {
        Ok(()) => info!("created session id: {}", id),
        Err(e) => warn!("failed to persist session id: {}; id is ephemeral", e),
    }
    id
}
