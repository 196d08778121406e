//! QUIC client for tooling that drives the driver from the orchestrator side.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicClientConfig;
use tracing::{debug, instrument};

use super::MAX_MESSAGE_SIZE;
use crate::error::CsiError;
use crate::message::CsiMessage;

/// One QUIC connection to an `s3csi` server; every request travels on its
/// own bi-stream.
pub struct CsiClient {
    endpoint: quinn::Endpoint,
    connection: quinn::Connection,
}

impl CsiClient {
    /// Connect to the server at `addr`.  `server_name` must match a SAN in
    /// the server certificate, and `tls_config` must trust its issuer.
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self, CsiError> {
        let crypto = QuicClientConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;

        let local = if addr.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0, 0, 0, 0], 0))
        };
        let mut endpoint = quinn::Endpoint::client(local).map_err(CsiError::transport)?;
        endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));

        let connection = endpoint
            .connect(addr, server_name)
            .map_err(CsiError::transport)?
            .await
            .map_err(CsiError::transport)?;

        debug!(%addr, %server_name, "connected to CSI server");
        Ok(Self {
            endpoint,
            connection,
        })
    }

    /// Send `msg` and return whatever the server answered, including
    /// [`CsiMessage::Error`] replies.  Response variants are refused locally.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        if !msg.is_request() {
            return Err(CsiError::InvalidArgument(format!(
                "{msg} is a response, not a request"
            )));
        }

        let (mut send, mut recv) = self
            .connection
            .open_bi()
            .await
            .map_err(CsiError::transport)?;

        let payload = serde_json::to_vec(msg).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;

        let buf = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(CsiError::transport)?;
        let response: CsiMessage = serde_json::from_slice(&buf)
            .map_err(|e| CsiError::TransportError(format!("malformed response: {e}")))?;

        debug!(%response, "CSI response received");
        Ok(response)
    }

    /// Like [`request`](Self::request), but a [`CsiMessage::Error`] reply
    /// comes back as `Err`.
    pub async fn call(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        match self.request(msg).await? {
            CsiMessage::Error(e) => Err(e),
            response => Ok(response),
        }
    }

    /// Close the connection and wait for the server to be told.
    pub async fn close(&self) {
        self.connection
            .close(quinn::VarInt::from_u32(0), b"client shutdown");
        self.endpoint.wait_idle().await;
    }
}
