//! [`ObjectBackend`] over the S3 HTTP API using `aws-sdk-s3`.
//!
//! The client is built from a single request's [`StoreConfig`]: static
//! credentials, path-style addressing, and the configured endpoint (whose
//! scheme decides whether TLS is used).

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CreateBucketConfiguration, Delete, ObjectIdentifier,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ObjectBackend, StoreClient, StoreConnector};
use crate::config::StoreConfig;
use crate::error::CsiError;

/// Region used for request signing when the secrets name none.
const DEFAULT_SIGNING_REGION: &str = "us-east-1";

/// S3 client scoped to one request.
#[derive(Debug, Clone)]
pub struct S3Backend {
    client: aws_sdk_s3::Client,
    region: String,
}

impl S3Backend {
    pub fn new(config: &StoreConfig) -> Self {
        let creds = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "s3csi-request-secrets",
        );
        let region = if config.region.is_empty() {
            DEFAULT_SIGNING_REGION.to_owned()
        } else {
            config.region.clone()
        };

        let sdk_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .credentials_provider(creds)
            .endpoint_url(config.endpoint_url())
            .force_path_style(true)
            .build();

        debug!(
            endpoint = %config.endpoint_url(),
            secure = config.is_secure(),
            %region,
            "S3 client configured"
        );
        Self {
            client: aws_sdk_s3::Client::from_conf(sdk_config),
            region,
        }
    }
}

/// Classify an SDK failure: connection-level problems mean the store is
/// unreachable, anything the store answered is an operation failure.
fn map_sdk_error<E, R>(operation: &str, target: &str, err: SdkError<E, R>) -> CsiError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let detail = format!("{operation} {target}: {}", DisplayErrorContext(&err));
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            CsiError::StoreUnavailable(detail)
        }
        _ => CsiError::StoreOperationFailed(detail),
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn head_bucket(&self, bucket: &str) -> Result<bool, CsiError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                // HEAD responses carry no body, so some stores only give a 404.
                let not_found = err.as_service_error().is_some_and(|e| e.is_not_found())
                    || err.raw_response().map(|r| r.status().as_u16()) == Some(404);
                if not_found {
                    Ok(false)
                } else {
                    Err(map_sdk_error("HeadBucket", bucket, err))
                }
            }
        }
    }

    async fn make_bucket(&self, bucket: &str) -> Result<(), CsiError> {
        let mut req = self.client.create_bucket().bucket(bucket);
        if self.region != DEFAULT_SIGNING_REGION {
            req = req.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        req.send()
            .await
            .map_err(|e| map_sdk_error("CreateBucket", bucket, e))?;
        Ok(())
    }

    async fn put_empty_object(&self, bucket: &str, key: &str) -> Result<(), CsiError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from_static(b""))
            .send()
            .await
            .map_err(|e| map_sdk_error("PutObject", &format!("{bucket}/{key}"), e))?;
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        tx: mpsc::Sender<String>,
    ) -> Result<(), CsiError> {
        let mut continuation_token = None;
        loop {
            let mut req = self.client.list_objects_v2().bucket(bucket);
            if !prefix.is_empty() {
                req = req.prefix(prefix);
            }
            if let Some(token) = continuation_token.take() {
                req = req.continuation_token(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| map_sdk_error("ListObjectsV2", bucket, e))?;

            for key in resp.contents().iter().filter_map(|obj| obj.key()) {
                if tx.send(key.to_owned()).await.is_err() {
                    return Ok(());
                }
            }

            if resp.is_truncated() != Some(true) {
                return Ok(());
            }
            continuation_token = resp.next_continuation_token().map(ToOwned::to_owned);
            if continuation_token.is_none() {
                return Ok(());
            }
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), CsiError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error("DeleteObject", &format!("{bucket}/{key}"), e))?;
        Ok(())
    }

    async fn delete_objects(
        &self,
        bucket: &str,
        keys: Vec<String>,
    ) -> Result<Vec<String>, CsiError> {
        let objects = keys
            .into_iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(CsiError::internal)?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(CsiError::internal)?;

        let resp = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .bypass_governance_retention(true)
            .send()
            .await
            .map_err(|e| map_sdk_error("DeleteObjects", bucket, e))?;

        // Quiet mode: only failures are reported back.
        let failed = resp
            .errors()
            .iter()
            .map(|e| {
                let key = e.key().unwrap_or_default().to_owned();
                warn!(
                    bucket,
                    %key,
                    code = e.code().unwrap_or_default(),
                    message = e.message().unwrap_or_default(),
                    "object not removed by bulk delete"
                );
                key
            })
            .collect();
        Ok(failed)
    }

    async fn remove_bucket(&self, bucket: &str) -> Result<(), CsiError> {
        self.client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| map_sdk_error("DeleteBucket", bucket, e))?;
        Ok(())
    }
}

/// Connects a fresh [`S3Backend`] for every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct S3Connector;

impl StoreConnector for S3Connector {
    fn connect(&self, config: &StoreConfig) -> Result<StoreClient, CsiError> {
        Ok(StoreClient::new(Arc::new(S3Backend::new(config))))
    }
}
