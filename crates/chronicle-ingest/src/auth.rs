//! OAuth2 collaborator surface.
//!
//! Credential acquisition itself (browser flows, auth-code capture)
//! lives outside the engine. The engine only knows: which provider and
//! scopes a data source declares, a process-wide hook that maps a
//! provider to an application able to mint tokens, and the opaque
//! authorization blob stored on the account row. The hook is installed
//! once at program start, before any operation.

use anyhow::anyhow;
use once_cell::sync::OnceCell;

use crate::error::{Error, Result};

/// Which OAuth2 provider a data source uses and the scopes it needs.
#[derive(Debug, Clone, Default)]
pub struct OAuth2 {
    /// Must be recognized by the installed application source.
    pub provider_id: String,
    pub scopes: Vec<String>,
}

/// An application able to produce tokens for one provider.
pub trait TokenSource: Send + Sync {
    /// Obtain an initial authorization blob for a new account. The blob
    /// is opaque to the engine and stored on the account row as-is.
    fn initial_token(&self) -> anyhow::Result<Vec<u8>>;
}

type AppSourceFn =
    Box<dyn Fn(&str, &[String]) -> anyhow::Result<Box<dyn TokenSource>> + Send + Sync>;

static APP_SOURCE: OnceCell<AppSourceFn> = OnceCell::new();

/// Install the process-wide OAuth2 application source. Programs using
/// OAuth2 data sources must call this before adding accounts or
/// creating clients; it can only be set once.
pub fn set_oauth2_app_source<F>(source: F) -> Result<()>
where
    F: Fn(&str, &[String]) -> anyhow::Result<Box<dyn TokenSource>> + Send + Sync + 'static,
{
    APP_SOURCE
        .set(Box::new(source))
        .map_err(|_| Error::Config("OAuth2 app source already installed".to_string()))
}

/// Obtain an initial authorization blob for the given descriptor.
pub(crate) fn authorize(oauth2: &OAuth2) -> Result<Vec<u8>> {
    let source = APP_SOURCE.get().ok_or_else(|| {
        Error::Authorization("no OAuth2 app source installed".to_string())
    })?;
    let app = source(&oauth2.provider_id, &oauth2.scopes)
        .map_err(|e| Error::Authorization(e.to_string()))?;
    app.initial_token()
        .map_err(|e| Error::Authorization(e.to_string()))
}

/// A token source backed by a pre-obtained blob, for providers whose
/// authorization was captured out of band.
pub struct StaticTokenSource {
    token: Option<Vec<u8>>,
}

impl StaticTokenSource {
    pub fn new(token: Option<Vec<u8>>) -> Self {
        StaticTokenSource { token }
    }
}

impl TokenSource for StaticTokenSource {
    fn initial_token(&self) -> anyhow::Result<Vec<u8>> {
        self.token
            .clone()
            .ok_or_else(|| anyhow!("no authorization token configured for this provider"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_token_source() {
        let src = StaticTokenSource::new(Some(b"blob".to_vec()));
        assert_eq!(src.initial_token().unwrap(), b"blob");

        let empty = StaticTokenSource::new(None);
        assert!(empty.initial_token().is_err());
    }
}
