//! Data-source adapter surface.
//!
//! A data source registers a [`DataSource`] descriptor in the
//! process-wide registry before first use (normally at program start).
//! The engine builds a [`Client`] per account from the descriptor's
//! factory and drives its one operation, [`Client::list_items`], which
//! streams item graphs into the processing channel.

pub mod jsonl;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chronicle_core::ItemGraph;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::account::Account;
use crate::auth::OAuth2;
use crate::error::{Error, Result};
use crate::options::Timeframe;
use crate::ratelimit::RateLimit;

/// A function that authenticates a user with a service, returning the
/// opaque credential blob to store on the account row.
pub type AuthenticateFn = Arc<dyn Fn(&str) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// A function that builds a client for one account.
pub type NewClientFn = Arc<dyn Fn(&Account) -> anyhow::Result<Box<dyn Client>> + Send + Sync>;

/// Saves an adapter's opaque progress blob onto the account row. The
/// call is a pure side effect; failures are logged, never returned.
pub type CheckpointRecorder = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Descriptor for a registered data source.
#[derive(Clone)]
pub struct DataSource {
    /// A snake_cased slug uniquely identifying the service.
    pub id: String,

    /// The human-readable or brand name of the service.
    pub name: String,

    /// Set when the service authenticates with OAuth2.
    pub oauth2: Option<OAuth2>,

    /// Set when the service uses some other form of authentication.
    /// Mutually exclusive with `oauth2`.
    pub authenticate: Option<AuthenticateFn>,

    /// The service's rate limit, if it enforces one. Clients should
    /// abide it through the account's rate limiter.
    pub rate_limit: Option<RateLimit>,

    /// Builds a client that can list items for an account.
    pub new_client: NewClientFn,
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("oauth2", &self.oauth2)
            .field("rate_limit", &self.rate_limit)
            .finish_non_exhaustive()
    }
}

/// Options for one listing run, passed to [`Client::list_items`].
pub struct ListOptions {
    /// A local file to read the data from, for import operations. Empty
    /// means "use the network".
    pub filename: Option<PathBuf>,

    /// Bounds on which items to list. The time and item-ID fields are
    /// never mutually contradictory.
    pub timeframe: Timeframe,

    /// The adapter's previously recorded progress blob, offered only
    /// when the recorded operation parameters match this run's.
    pub checkpoint: Option<Vec<u8>>,

    /// Saves a new progress blob; call at any time during the listing.
    pub recorder: Option<CheckpointRecorder>,

    /// Enable verbose output.
    pub verbose: bool,
}

/// A client that can interact with a data source for one account.
#[async_trait]
pub trait Client: Send {
    /// List the account's items into `output`, combining related items
    /// into a single graph so their relationships are stored. Processing
    /// is idempotent, so re-listing an item is harmless.
    ///
    /// Implementations must poll `cancel` and return promptly once it is
    /// cancelled. The output channel closes when the sender is dropped
    /// on return.
    ///
    /// If `options.filename` is set, list from that file instead of the
    /// network (or return an error if imports are unsupported); if a
    /// filename is required but missing, return an error. If
    /// `options.checkpoint` is set, resume from it instead of starting
    /// over.
    async fn list_items(
        &mut self,
        cancel: CancellationToken,
        output: mpsc::Sender<Arc<ItemGraph>>,
        options: ListOptions,
    ) -> anyhow::Result<()>;
}

static REGISTRY: Lazy<RwLock<HashMap<String, DataSource>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a data source. Must be called before the source is first
/// used (normally from the program's startup path); registering a
/// duplicate id fails.
pub fn register(ds: DataSource) -> Result<()> {
    if ds.id.is_empty() {
        return Err(Error::Config("data source is missing an ID".to_string()));
    }
    if ds.name.is_empty() {
        return Err(Error::Config("data source is missing a name".to_string()));
    }
    if ds.oauth2.is_some() && ds.authenticate.is_some() {
        return Err(Error::Config(format!(
            "data source {} declares conflicting ways of obtaining authorization",
            ds.id
        )));
    }

    let mut registry = REGISTRY.write();
    if registry.contains_key(&ds.id) {
        return Err(Error::Config(format!(
            "data source already registered: {}",
            ds.id
        )));
    }
    registry.insert(ds.id.clone(), ds);
    Ok(())
}

/// Look up a registered data source by id.
pub(crate) fn lookup(id: &str) -> Option<DataSource> {
    REGISTRY.read().get(id).cloned()
}

/// The (id, name) of every registered data source.
pub(crate) fn registered() -> Vec<(String, String)> {
    REGISTRY
        .read()
        .values()
        .map(|ds| (ds.id.clone(), ds.name.clone()))
        .collect()
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Register a descriptor under a unique test id, with a factory that
    /// fails; tests that need a working client construct sessions
    /// directly.
    pub(crate) fn register_stub(id: &str) -> DataSource {
        let ds = DataSource {
            id: id.to_string(),
            name: format!("Stub {id}"),
            oauth2: None,
            authenticate: None,
            rate_limit: None,
            new_client: Arc::new(|_| Err(anyhow::anyhow!("stub has no client"))),
        };
        // Ignore duplicate registration across tests in one process.
        let _ = register(ds.clone());
        ds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> DataSource {
        DataSource {
            id: id.to_string(),
            name: "Test Service".to_string(),
            oauth2: None,
            authenticate: None,
            rate_limit: None,
            new_client: Arc::new(|_| Err(anyhow::anyhow!("no client"))),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        register(descriptor("svc_lookup")).unwrap();
        let ds = lookup("svc_lookup").unwrap();
        assert_eq!(ds.name, "Test Service");
        assert!(lookup("svc_absent").is_none());
    }

    #[test]
    fn test_register_rejects_duplicate_id() {
        register(descriptor("svc_dup")).unwrap();
        let err = register(descriptor("svc_dup")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_register_rejects_missing_fields() {
        let mut ds = descriptor("");
        assert!(register(ds.clone()).is_err());
        ds.id = "svc_unnamed".to_string();
        ds.name = String::new();
        assert!(register(ds).is_err());
    }

    #[test]
    fn test_register_rejects_conflicting_auth() {
        let mut ds = descriptor("svc_conflicting_auth");
        ds.oauth2 = Some(OAuth2 {
            provider_id: "prov".to_string(),
            scopes: vec![],
        });
        ds.authenticate = Some(Arc::new(|_| Ok(vec![])));
        assert!(register(ds).is_err());
    }
}
