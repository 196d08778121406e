//! Driver and object store configuration.
//!
//! [`StoreConfig`] is rebuilt from the secrets of every request and never
//! cached; [`DriverOptions`] is the process-wide configuration assembled by
//! the daemon at startup.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use url::Url;

use crate::error::CsiError;
use crate::types::Secrets;

pub const SECRET_ACCESS_KEY_ID: &str = "accessKeyID";
pub const SECRET_SECRET_ACCESS_KEY: &str = "secretAccessKey";
pub const SECRET_REGION: &str = "region";
pub const SECRET_ENDPOINT: &str = "endpoint";
pub const SECRET_MOUNTER: &str = "mounter";

/// Connection settings for the object store, scoped to one request.
#[derive(Clone)]
pub struct StoreConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Empty when the store does not care about regions.
    pub region: String,
    /// Parsed endpoint; scheme is `http` or `https`.
    pub endpoint: Url,
    /// Store-wide default mounter, used when the volume names none.
    pub mounter: Option<String>,
}

impl StoreConfig {
    /// Build a config from request secrets.
    ///
    /// Fails with [`CsiError::InvalidArgument`] if the endpoint is missing,
    /// does not parse, or uses a scheme other than `http`/`https`.
    pub fn from_secrets(secrets: &Secrets) -> Result<Self, CsiError> {
        let get = |key: &str| secrets.get(key).cloned().unwrap_or_default();

        let raw_endpoint = get(SECRET_ENDPOINT);
        if raw_endpoint.is_empty() {
            return Err(CsiError::InvalidArgument(
                "secrets: endpoint is missing".into(),
            ));
        }
        let endpoint = Url::parse(&raw_endpoint).map_err(|e| {
            CsiError::InvalidArgument(format!("secrets: invalid endpoint {raw_endpoint}: {e}"))
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(CsiError::InvalidArgument(format!(
                "secrets: endpoint scheme must be http or https, got {}",
                endpoint.scheme()
            )));
        }

        Ok(Self {
            access_key_id: get(SECRET_ACCESS_KEY_ID),
            secret_access_key: get(SECRET_SECRET_ACCESS_KEY),
            region: get(SECRET_REGION),
            endpoint,
            mounter: secrets.get(SECRET_MOUNTER).filter(|m| !m.is_empty()).cloned(),
        })
    }

    /// Whether the store connection uses TLS.
    pub fn is_secure(&self) -> bool {
        self.endpoint.scheme() == "https"
    }

    /// Endpoint as passed to the SDK and to `s3fs` (no trailing slash).
    pub fn endpoint_url(&self) -> String {
        self.endpoint.as_str().trim_end_matches('/').to_owned()
    }
}

// Keep the secret key out of logs.
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint.as_str())
            .field("mounter", &self.mounter)
            .finish()
    }
}

/// Default plugin name reported through the Identity service.
pub const DEFAULT_DRIVER_NAME: &str = "s3.csi.rk8s.io";
/// Mounter used when neither the volume nor the secrets name one.
pub const DEFAULT_MOUNTER: &str = "s3fs";

/// Process-wide driver configuration.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Plugin name reported by `GetPluginInfo`.
    pub driver_name: String,
    /// Identifier of the node this process runs on.
    pub node_id: String,
    /// Address the QUIC server listens on.
    pub listen_addr: SocketAddr,
    /// Mounter used as the last fallback.
    pub default_mounter: String,
    /// Mode applied to published target paths; `None` leaves them alone.
    pub mount_permissions: Option<u32>,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            node_id: String::new(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7443)),
            default_mounter: DEFAULT_MOUNTER.to_owned(),
            mount_permissions: None,
            tls_cert: PathBuf::from("/etc/s3csi/tls.crt"),
            tls_key: PathBuf::from("/etc/s3csi/tls.key"),
        }
    }
}
