//! HTTP catalog client.

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use gapsync_common::{Error, IdWindow, Record, Result};

use crate::source::{RemoteSource, WindowPage};

/// Default catalog base URL.
pub const DEFAULT_BASE_URL: &str = "https://connect.wealthx.com/rest/v1/";

/// Static per-request credentials, sent as `username`/`password` headers.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Create credentials.
    ///
    /// # Errors
    /// - Either value is empty
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let username = username.into();
        let password = password.into();
        if username.is_empty() || password.is_empty() {
            return Err(Error::Config(
                "Catalog credentials (username/password) must not be empty".to_string(),
            ));
        }
        Ok(Self { username, password })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials({}, [REDACTED])", self.username)
    }
}

/// Connection settings for [`HttpSource`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSourceConfig {
    /// Base URL of the catalog API.
    pub base_url: String,
    /// Window endpoint, relative to `base_url`.
    pub endpoint: String,
    /// Value of the record type filter sent with every request.
    pub record_type: String,
    /// Document field holding the source identifier.
    pub id_field: String,
    /// Timeout for window fetches.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Timeout for reachability probes.
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            endpoint: "alldossiers".to_string(),
            record_type: "both".to_string(),
            id_field: "ID".to_string(),
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Window response as sent by the catalog.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WindowPayload {
    #[serde(default, alias = "records")]
    dossiers: Vec<Value>,
    #[serde(default, alias = "total", alias = "declaredTotal")]
    total_dossiers: Option<u64>,
    #[serde(default)]
    last_index_id: Option<u64>,
}

/// Catalog reached over HTTP.
pub struct HttpSource {
    http: Client,
    endpoint: Url,
    credentials: Credentials,
    config: HttpSourceConfig,
}

impl HttpSource {
    /// Create a new HTTP source.
    ///
    /// # Errors
    /// - Base URL or endpoint does not parse
    /// - HTTP client cannot be built
    pub fn new(config: HttpSourceConfig, credentials: Credentials) -> Result<Self> {
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base)
            .and_then(|b| b.join(&config.endpoint))
            .map_err(|e| Error::Config(format!("Invalid catalog URL: {}", e)))?;

        let http = Client::builder()
            .user_agent(concat!("gapsync/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint,
            credentials,
            config,
        })
    }

    /// The fully resolved window endpoint.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn request_window(&self, window: IdWindow, timeout: Duration) -> Result<WindowPayload> {
        let response = self
            .http
            .get(self.endpoint.clone())
            .header("username", &self.credentials.username)
            .header("password", &self.credentials.password)
            .header(header::ACCEPT, "application/json")
            .query(&[
                ("dossierType", self.config.record_type.clone()),
                ("fromIndex", window.from().to_string()),
                ("toIndex", window.to().to_string()),
            ])
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_transport(e, window))?;

        self.handle_response(response).await
    }

    /// Map a response to a payload or a classified error.
    async fn handle_response(&self, response: Response) -> Result<WindowPayload> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<WindowPayload>()
                .await
                .map_err(|e| Error::Serialization(format!("Invalid window response: {}", e)));
        }

        let body = response.text().await.unwrap_or_default();
        let message: String = body.chars().take(200).collect();
        if is_transient_status(status) {
            Err(Error::Network(format!("HTTP {}: {}", status, message)))
        } else {
            Err(Error::Remote {
                status: status.as_u16(),
                message,
            })
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn classify_transport(err: reqwest::Error, window: IdWindow) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("Window {} timed out: {}", window, err))
    } else {
        Error::Network(format!("Failed to fetch window {}: {}", window, err))
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch_window(&self, window: IdWindow) -> Result<WindowPage> {
        debug!("Requesting window {} from {}", window, self.endpoint);
        let payload = self
            .request_window(window, self.config.request_timeout)
            .await?;

        let records: Vec<Record> = payload
            .dossiers
            .into_iter()
            .map(|doc| Record::from_document(doc, &self.config.id_field))
            .collect();

        let missing = records.iter().filter(|r| r.id.is_none()).count();
        if missing > 0 {
            warn!(
                "{} records in window {} lack the '{}' field",
                missing, window, self.config.id_field
            );
        }

        info!(
            "Retrieved {} records for window {} (lastIndex: {:?})",
            records.len(),
            window,
            payload.last_index_id
        );

        Ok(WindowPage {
            records,
            declared_total: payload.total_dossiers,
            last_index: payload.last_index_id,
        })
    }

    async fn check_reachable(&self) -> bool {
        let probe = match IdWindow::new(1, 1) {
            Ok(w) => w,
            Err(_) => return false,
        };
        match self.request_window(probe, self.config.probe_timeout).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Catalog probe failed: {}", e);
                false
            }
        }
    }

    async fn declared_total(&self) -> Result<u64> {
        let probe = IdWindow::new(1, 1)?;
        let payload = self
            .request_window(probe, self.config.request_timeout)
            .await?;
        let total = payload.total_dossiers.unwrap_or(0);
        info!("Catalog declares {} records", total);
        Ok(total)
    }
}
