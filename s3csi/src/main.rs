//! s3csi - CSI driver daemon for S3-compatible object storage.
//!
//! Serves the Identity, Controller and Node services over QUIC.  The same
//! binary runs as controller and as node plugin; which RPCs arrive decides
//! the role.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `S3CSI_LISTEN` | `0.0.0.0:7443` | QUIC bind address |
//! | `S3CSI_NODE_ID` | *(required)* | Node identifier reported by `NodeGetInfo` |
//! | `S3CSI_DRIVER_NAME` | `s3.csi.rk8s.io` | Plugin name |
//! | `S3CSI_TLS_CERT` / `S3CSI_TLS_KEY` | `/etc/s3csi/tls.{crt,key}` | PEM server certificate and key |
//! | `S3CSI_DEFAULT_MOUNTER` | `s3fs` | Mounter when neither volume nor secrets name one |
//! | `S3CSI_MOUNT_PERMISSIONS` | *(unset)* | Octal mode applied to published targets |
//! | `S3CSI_LOG_LEVEL` | `info` | Log level filter |
//! | `S3CSI_LOG_JSON` | `false` | Emit JSON log lines |
//! | `RUST_LOG` | *(unset)* | Fine-grained tracing filter (overrides `S3CSI_LOG_LEVEL`) |

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use libs3csi::config::{DEFAULT_DRIVER_NAME, DEFAULT_MOUNTER};
use libs3csi::transport::CsiServer;
use libs3csi::{DriverOptions, S3Connector, S3Driver, SystemMounts};
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "s3csi", version, about = "CSI driver for S3-compatible object storage")]
struct Cli {
    /// Address the QUIC endpoint listens on
    #[arg(long, env = "S3CSI_LISTEN", default_value = "0.0.0.0:7443")]
    listen: SocketAddr,

    /// Identifier of the node this process runs on
    #[arg(long, env = "S3CSI_NODE_ID")]
    node_id: String,

    /// Plugin name reported to the orchestrator
    #[arg(long, env = "S3CSI_DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    driver_name: String,

    /// PEM certificate chain for the QUIC endpoint
    #[arg(long, env = "S3CSI_TLS_CERT", value_name = "FILE", default_value = "/etc/s3csi/tls.crt")]
    tls_cert: PathBuf,

    /// PEM private key for the QUIC endpoint
    #[arg(long, env = "S3CSI_TLS_KEY", value_name = "FILE", default_value = "/etc/s3csi/tls.key")]
    tls_key: PathBuf,

    /// Mounter used when neither the volume nor its secrets name one
    #[arg(long, env = "S3CSI_DEFAULT_MOUNTER", default_value = DEFAULT_MOUNTER)]
    default_mounter: String,

    /// Octal mode applied to published target paths (e.g. 0777)
    #[arg(long, env = "S3CSI_MOUNT_PERMISSIONS", value_parser = parse_mode)]
    mount_permissions: Option<u32>,

    #[arg(long, env = "S3CSI_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "S3CSI_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            driver_name: self.driver_name.clone(),
            node_id: self.node_id.clone(),
            listen_addr: self.listen,
            default_mounter: self.default_mounter.clone(),
            mount_permissions: self.mount_permissions,
            tls_cert: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
        }
    }
}

fn parse_mode(s: &str) -> Result<u32, String> {
    let digits = s.strip_prefix("0o").unwrap_or(s);
    let mode = u32::from_str_radix(digits, 8).map_err(|e| format!("invalid octal mode {s:?}: {e}"))?;
    if mode > 0o7777 {
        return Err(format!("mode {s} out of range"));
    }
    Ok(mode)
}

/// Initialize the tracing subscriber.
///
/// Uses `RUST_LOG` if set, otherwise the `--log-level` value.
fn init_tracing(log_level: &str, json: bool) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid log level filter: {log_level}"))?
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// Build a TLS 1.3 server configuration (required by QUIC) from PEM files.
fn load_tls(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig> {
    let cert_file = File::open(cert_path)
        .with_context(|| format!("open certificate {}", cert_path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse certificate {}", cert_path.display()))?;

    let key_file =
        File::open(key_path).with_context(|| format!("open key {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("parse key {}", key_path.display()))?
        .with_context(|| format!("no private key in {}", key_path.display()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("select TLS 1.3")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build TLS server config")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json)?;

    let options = cli.driver_options();
    let tls = load_tls(&options.tls_cert, &options.tls_key)?;

    info!(
        driver = %options.driver_name,
        node_id = %options.node_id,
        version = VERSION,
        "starting s3csi"
    );

    let listen_addr = options.listen_addr;
    let driver = S3Driver::new(options, Arc::new(S3Connector), Arc::new(SystemMounts::new()));
    let server = CsiServer::new(listen_addr, tls, Arc::new(driver))?;

    tokio::select! {
        res = server.serve() => res?,
        _ = tokio::signal::ctrl_c() => info!("received shutdown signal"),
    }
    server.shutdown().await;
    Ok(())
}
