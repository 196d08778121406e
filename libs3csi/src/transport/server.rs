//! QUIC server that runs the driver and dispatches incoming CSI requests to
//! the appropriate trait implementations.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicServerConfig;
use tracing::{debug, error, info, instrument, warn};

use super::MAX_MESSAGE_SIZE;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// A CSI server that accepts QUIC connections and dispatches
/// [`CsiMessage`] requests to an [`CsiIdentity`] + [`CsiController`] +
/// [`CsiNode`] implementation.
pub struct CsiServer<T> {
    endpoint: quinn::Endpoint,
    handler: Arc<T>,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    /// Create a new server bound to `addr`.
    ///
    /// QUIC requires TLS 1.3, so `tls_config` must allow it.
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        handler: Arc<T>,
    ) -> Result<Self, CsiError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint = quinn::Endpoint::server(server_config, addr).map_err(CsiError::transport)?;
        info!(%addr, "CSI QUIC server listening");
        Ok(Self { endpoint, handler })
    }

    /// Accept connections in a loop until the endpoint is closed.
    ///
    /// Each accepted connection spawns a Tokio task, and each bi-stream
    /// within a connection is handled concurrently.
    pub async fn serve(&self) -> Result<(), CsiError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!(%remote, "CSI connection accepted");
                        if let Err(e) = Self::handle_connection(conn, handler).await {
                            warn!(%remote, error = %e, "CSI connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "CSI incoming connection failed");
                    }
                }
            });
        }
        Ok(())
    }

    /// Handle all bi-streams on a single connection.
    async fn handle_connection(conn: quinn::Connection, handler: Arc<T>) -> Result<(), CsiError> {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_)) => return Ok(()),
                Err(e) => return Err(CsiError::transport(e)),
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, &handler).await {
                    error!(error = %e, "CSI stream handler error");
                }
            });
        }
    }

    /// Process a single bi-stream: read request → dispatch → write response.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        handler: &T,
    ) -> Result<(), CsiError> {
        // Read the full request.
        let buf = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(CsiError::transport)?;

        let request: CsiMessage = serde_json::from_slice(&buf)
            .map_err(|e| CsiError::TransportError(format!("malformed request: {e}")))?;

        debug!(%request, "CSI request received");

        let response = Self::dispatch(handler, request).await;

        // Serialize and send the response.
        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;
        Ok(())
    }

    /// Map a [`CsiMessage`] request to the correct trait method call and
    /// wrap the result in a response [`CsiMessage`].
    pub(crate) async fn dispatch(handler: &T, request: CsiMessage) -> CsiMessage {
        let response = match request {
            // --- Identity ---------------------------------------------------
            CsiMessage::Probe => reply(handler.probe().await, CsiMessage::ProbeResult),
            CsiMessage::GetPluginInfo => {
                reply(handler.get_plugin_info().await, CsiMessage::PluginInfoResponse)
            }
            CsiMessage::GetPluginCapabilities => reply(
                handler.get_plugin_capabilities().await,
                CsiMessage::PluginCapabilitiesResponse,
            ),

            // --- Controller -------------------------------------------------
            CsiMessage::CreateVolume(req) => {
                reply(handler.create_volume(req).await, CsiMessage::VolumeCreated)
            }
            CsiMessage::DeleteVolume(req) => ack(handler.delete_volume(req).await),
            CsiMessage::ValidateVolumeCapabilities(req) => reply(
                handler.validate_volume_capabilities(req).await,
                CsiMessage::CapabilityValidation,
            ),
            CsiMessage::ControllerGetCapabilities => reply(
                handler.get_controller_capabilities().await,
                CsiMessage::ControllerCapabilities,
            ),
            CsiMessage::ListVolumes => reply(handler.list_volumes().await, CsiMessage::VolumeList),
            CsiMessage::GetCapacity => reply(handler.get_capacity().await, CsiMessage::Capacity),
            CsiMessage::ControllerPublishVolume { volume_id, node_id } => {
                ack(handler.controller_publish_volume(&volume_id, &node_id).await)
            }
            CsiMessage::ControllerExpandVolume {
                volume_id,
                capacity_bytes,
            } => reply(
                handler
                    .controller_expand_volume(&volume_id, capacity_bytes)
                    .await,
                CsiMessage::VolumeExpanded,
            ),
            CsiMessage::CreateSnapshot {
                source_volume_id,
                name,
            } => reply(
                handler.create_snapshot(&source_volume_id, &name).await,
                CsiMessage::SnapshotCreated,
            ),
            CsiMessage::DeleteSnapshot { snapshot_id } => {
                ack(handler.delete_snapshot(&snapshot_id).await)
            }
            CsiMessage::ListSnapshots => {
                reply(handler.list_snapshots().await, CsiMessage::SnapshotList)
            }

            // --- Node -------------------------------------------------------
            CsiMessage::StageVolume(req) => ack(handler.stage_volume(req).await),
            CsiMessage::UnstageVolume {
                volume_id,
                staging_target_path,
            } => ack(
                handler
                    .unstage_volume(&volume_id, &staging_target_path)
                    .await,
            ),
            CsiMessage::PublishVolume(req) => ack(handler.publish_volume(req).await),
            CsiMessage::UnpublishVolume {
                volume_id,
                target_path,
            } => ack(handler.unpublish_volume(&volume_id, &target_path).await),
            CsiMessage::NodeGetCapabilities => reply(
                handler.get_node_capabilities().await,
                CsiMessage::NodeCapabilities,
            ),
            CsiMessage::GetNodeInfo => {
                reply(handler.get_info().await, CsiMessage::NodeInfoResponse)
            }
            CsiMessage::NodeGetVolumeStats {
                volume_id,
                volume_path,
            } => reply(
                handler.get_volume_stats(&volume_id, &volume_path).await,
                CsiMessage::VolumeStats,
            ),
            CsiMessage::NodeExpandVolume {
                volume_id,
                volume_path,
                capacity_bytes,
            } => reply(
                handler
                    .expand_volume(&volume_id, &volume_path, capacity_bytes)
                    .await,
                CsiMessage::VolumeExpanded,
            ),

            // --- Response variants should never arrive as requests ----------
            other => {
                warn!(msg = %other, "unexpected message variant received as request");
                CsiMessage::Error(CsiError::InvalidArgument(format!(
                    "unexpected message: {other}"
                )))
            }
        };

        if let CsiMessage::Error(e) = &response {
            warn!(error = %e, status = ?e.status_code(), "CSI request failed");
        }
        response
    }

    /// Return a reference to the underlying QUIC endpoint, useful for
    /// obtaining the local address or shutting down.
    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }

    /// Close every connection and wait until peers have been told.
    pub async fn shutdown(&self) {
        self.endpoint
            .close(quinn::VarInt::from_u32(0), b"server shutdown");
        self.endpoint.wait_idle().await;
        info!("CSI QUIC server stopped");
    }
}

fn reply<V>(result: Result<V, CsiError>, wrap: impl FnOnce(V) -> CsiMessage) -> CsiMessage {
    match result {
        Ok(value) => wrap(value),
        Err(e) => CsiMessage::Error(e),
    }
}

fn ack(result: Result<(), CsiError>) -> CsiMessage {
    reply(result, |()| CsiMessage::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverOptions, SECRET_ENDPOINT};
    use crate::driver::S3Driver;
    use crate::mount::HostMounts;
    use crate::mount::fake::FakeMounts;
    use crate::store::{MemoryBackend, StoreConnector};
    use crate::transport::CsiClient;
    use crate::types::*;
    use rcgen::{CertificateParams, KeyPair};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    const SERVER_NAME: &str = "s3csi.test";

    /// Server and client TLS configs sharing a throwaway CA.
    fn test_tls() -> (rustls::ServerConfig, rustls::ClientConfig) {
        let ca_key = KeyPair::generate().expect("generate CA key");
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).expect("CA params");
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).expect("self-sign CA");

        let key = KeyPair::generate().expect("generate server key");
        let mut params =
            CertificateParams::new(vec![SERVER_NAME.to_owned()]).expect("server params");
        params.is_ca = rcgen::IsCa::NoCa;
        let cert = params
            .signed_by(&key, &ca_cert, &ca_key)
            .expect("sign server cert");

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let server = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .expect("TLS 1.3")
            .with_no_client_auth()
            .with_single_cert(
                vec![CertificateDer::from(cert.der().to_vec())],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
            )
            .expect("server config");

        let mut roots = rustls::RootCertStore::empty();
        roots
            .add(CertificateDer::from(ca_cert.der().to_vec()))
            .expect("add CA cert");
        let client = rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .expect("TLS 1.3")
            .with_root_certificates(roots)
            .with_no_client_auth();

        (server, client)
    }

    fn driver(store: &Arc<MemoryBackend>) -> S3Driver {
        S3Driver::new(
            DriverOptions::default(),
            Arc::new(Arc::clone(store)) as Arc<dyn StoreConnector>,
            Arc::new(FakeMounts::default()) as Arc<dyn HostMounts>,
        )
    }

    async fn dispatch(handler: &S3Driver, request: CsiMessage) -> CsiMessage {
        CsiServer::<S3Driver>::dispatch(handler, request).await
    }

    #[tokio::test]
    async fn dispatch_routes_controller_requests() {
        let store = Arc::new(MemoryBackend::new());
        let handler = driver(&store);
        let secrets = Secrets::from([(SECRET_ENDPOINT.to_owned(), "http://minio:9000".to_owned())]);

        let response = dispatch(
            &handler,
            CsiMessage::CreateVolume(CreateVolumeRequest {
                name: "vol-1".into(),
                volume_capabilities: vec![VolumeCapability::default()],
                secrets: secrets.clone(),
                ..Default::default()
            }),
        )
        .await;
        assert!(matches!(response, CsiMessage::VolumeCreated(v) if v.volume_id.as_str() == "vol-1"));

        let response = dispatch(
            &handler,
            CsiMessage::DeleteVolume(DeleteVolumeRequest {
                volume_id: VolumeId::from("vol-1"),
                secrets,
            }),
        )
        .await;
        assert!(matches!(response, CsiMessage::Ok));
        assert!(!store.has_bucket("vol-1"));
    }

    #[tokio::test]
    async fn dispatch_answers_unsupported_and_misdirected() {
        let store = Arc::new(MemoryBackend::new());
        let handler = driver(&store);

        for request in [
            CsiMessage::ListVolumes,
            CsiMessage::GetCapacity,
            CsiMessage::ListSnapshots,
            CsiMessage::DeleteSnapshot {
                snapshot_id: "snap-1".into(),
            },
            CsiMessage::NodeExpandVolume {
                volume_id: VolumeId::from("vol-1"),
                volume_path: "/mnt".into(),
                capacity_bytes: 1,
            },
        ] {
            let response = dispatch(&handler, request).await;
            assert!(matches!(
                response,
                CsiMessage::Error(CsiError::Unsupported { .. })
            ));
        }

        let response = dispatch(&handler, CsiMessage::Ok).await;
        assert!(matches!(
            response,
            CsiMessage::Error(CsiError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn dispatch_identity_and_node_queries() {
        let store = Arc::new(MemoryBackend::new());
        let handler = driver(&store);

        assert!(matches!(
            dispatch(&handler, CsiMessage::Probe).await,
            CsiMessage::ProbeResult(true)
        ));
        assert!(matches!(
            dispatch(&handler, CsiMessage::NodeGetCapabilities).await,
            CsiMessage::NodeCapabilities(caps) if caps == vec![NodeCapability::StageUnstageVolume]
        ));
        assert!(matches!(
            dispatch(&handler, CsiMessage::GetPluginCapabilities).await,
            CsiMessage::PluginCapabilitiesResponse(_)
        ));
    }

    #[tokio::test]
    async fn client_and_server_over_quic() {
        let (server_tls, client_tls) = test_tls();
        let store = Arc::new(MemoryBackend::new());
        let server = Arc::new(
            CsiServer::new(
                SocketAddr::from(([127, 0, 0, 1], 0)),
                server_tls,
                Arc::new(driver(&store)),
            )
            .unwrap(),
        );
        let addr = server.endpoint().local_addr().unwrap();
        let serving = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve().await }
        });

        let client = CsiClient::connect(addr, SERVER_NAME, client_tls)
            .await
            .unwrap();
        let secrets = Secrets::from([(SECRET_ENDPOINT.to_owned(), "http://minio:9000".to_owned())]);

        let created = client
            .call(&CsiMessage::CreateVolume(CreateVolumeRequest {
                name: "vol-1".into(),
                volume_capabilities: vec![VolumeCapability::default()],
                parameters: [("bucket".to_owned(), "shared".to_owned())].into(),
                secrets: secrets.clone(),
                ..Default::default()
            }))
            .await
            .unwrap();
        assert!(
            matches!(created, CsiMessage::VolumeCreated(v) if v.volume_id.as_str() == "shared/vol-1")
        );
        assert_eq!(store.objects("shared"), Some(vec!["vol-1/".to_owned()]));

        let deleted = client
            .call(&CsiMessage::DeleteVolume(DeleteVolumeRequest {
                volume_id: VolumeId::from("shared/vol-1"),
                secrets,
            }))
            .await
            .unwrap();
        assert!(matches!(deleted, CsiMessage::Ok));
        // The last prefix took the shared bucket with it.
        assert!(!store.has_bucket("shared"));

        // Error replies surface as Err from `call`, as-is from `request`.
        let err = client.call(&CsiMessage::ListSnapshots).await.unwrap_err();
        assert!(matches!(err, CsiError::Unsupported { .. }));
        assert!(matches!(
            client.request(&CsiMessage::GetCapacity).await.unwrap(),
            CsiMessage::Error(CsiError::Unsupported { .. })
        ));

        // Several requests share the one connection.
        assert!(matches!(
            client.call(&CsiMessage::Probe).await.unwrap(),
            CsiMessage::ProbeResult(true)
        ));

        let err = client.request(&CsiMessage::Ok).await.unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));

        client.close().await;
        server.shutdown().await;
        serving.await.unwrap().unwrap();
    }
}
