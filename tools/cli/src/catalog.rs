//! HTTP catalog built on first use.
//!
//! Offline commands (plan, set-target, reset, cleanup) never touch the
//! catalog, so missing credentials only matter once a call is made.

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use gapsync_common::{Error, IdWindow, Result};
use gapsync_source::{Credentials, HttpSource, HttpSourceConfig, RemoteSource, WindowPage};

pub const USERNAME_VAR: &str = "GAPSYNC_USERNAME";
pub const PASSWORD_VAR: &str = "GAPSYNC_PASSWORD";

/// Credentials from the environment, if both variables are set.
pub fn credentials_from_env() -> Option<Credentials> {
    let username = std::env::var(USERNAME_VAR).ok()?;
    let password = std::env::var(PASSWORD_VAR).ok()?;
    Credentials::new(username, password).ok()
}

/// [`HttpSource`] that is only constructed when a catalog call is made.
pub struct LazyCatalog {
    config: HttpSourceConfig,
    credentials: Option<Credentials>,
    http: OnceCell<HttpSource>,
}

impl LazyCatalog {
    pub fn new(config: HttpSourceConfig, credentials: Option<Credentials>) -> Self {
        Self {
            config,
            credentials,
            http: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&HttpSource> {
        self.http
            .get_or_try_init(|| async {
                let credentials = self.credentials.clone().ok_or_else(|| {
                    Error::Config(format!(
                        "{} and {} must be set to reach the catalog",
                        USERNAME_VAR, PASSWORD_VAR
                    ))
                })?;
                let http = HttpSource::new(self.config.clone(), credentials)?;
                info!("Using catalog at {}", http.endpoint());
                Ok(http)
            })
            .await
    }
}

#[async_trait]
impl RemoteSource for LazyCatalog {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch_window(&self, window: IdWindow) -> Result<WindowPage> {
        self.client().await?.fetch_window(window).await
    }

    async fn check_reachable(&self) -> bool {
        match self.client().await {
            Ok(http) => http.check_reachable().await,
            Err(e) => {
                warn!("Catalog not usable: {}", e);
                false
            }
        }
    }

    async fn declared_total(&self) -> Result<u64> {
        self.client().await?.declared_total().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_credentials_fail_on_use() {
        let catalog = LazyCatalog::new(HttpSourceConfig::default(), None);

        assert!(!catalog.check_reachable().await);
        assert!(matches!(
            catalog.declared_total().await,
            Err(Error::Config(_))
        ));
        let window = IdWindow::new(1, 10).unwrap();
        assert!(matches!(
            catalog.fetch_window(window).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_url_reported_on_use() {
        let config = HttpSourceConfig {
            base_url: "not a url".to_string(),
            ..HttpSourceConfig::default()
        };
        let catalog = LazyCatalog::new(config, Credentials::new("u", "p").ok());
        assert!(matches!(
            catalog.declared_total().await,
            Err(Error::Config(_))
        ));
    }
}
