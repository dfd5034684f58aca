use crate::backend::{embedding_hostname, not_connected, pick, BoxReader, RemoteStorage};
use crate::transfer::{read_part, upload_parts};
use crate::walk::{drain_pages, walk_with_deadline, PageSource};
use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime as S3DateTime};
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, ObjectCannedAcl, ServerSideEncryption,
};
use aws_sdk_s3::{Client, Error as S3Error};
use aws_smithy_runtime::client::http::hyper_014::HyperClientBuilder;
use aws_smithy_runtime_api::client::http::SharedHttpClient;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tablesnap_core::config::S3Config;
use tablesnap_core::{embed_hostname, join_key, strip_prefix, Error, RemoteFile, Result};
use tracing::{debug, info, warn};

const KIND: &str = "S3";
const LIST_PAGE_SIZE: i32 = 1000;

pub struct S3Backend {
    config: S3Config,
    client: Option<Client>,
    hostname: Option<String>,
}

impl S3Backend {
    pub fn new(config: S3Config) -> Self {
        let hostname = embedding_hostname(config.path_hostname_include);
        Self {
            config,
            client: None,
            hostname,
        }
    }

    /// Overrides the hostname used when `path_hostname_include` is set.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    fn client(&self) -> Result<&Client> {
        self.client.as_ref().ok_or_else(|| not_connected(KIND))
    }

    fn full_key(&self, key: &str) -> String {
        join_key(&self.config.path, key)
    }

    fn upload_key(&self, key: &str) -> String {
        match &self.hostname {
            Some(hostname) if self.config.path_hostname_include => embed_hostname(key, hostname),
            _ => key.to_string(),
        }
    }

    /// Endpoint URL with the scheme implied by `disable_ssl` when none is given.
    fn endpoint(&self) -> Option<String> {
        let endpoint = self.config.endpoint.trim_end_matches('/');
        if endpoint.is_empty() {
            return None;
        }
        let scheme = if self.config.disable_ssl { "http" } else { "https" };
        let endpoint = match endpoint.split_once("://") {
            Some((_, rest)) => format!("{}://{}", scheme, rest),
            None => format!("{}://{}", scheme, endpoint),
        };
        Some(endpoint)
    }

    fn acl(&self) -> Option<ObjectCannedAcl> {
        (!self.config.acl.is_empty()).then(|| ObjectCannedAcl::from(self.config.acl.as_str()))
    }

    fn sse(&self) -> Option<ServerSideEncryption> {
        (!self.config.sse.is_empty()).then(|| ServerSideEncryption::from(self.config.sse.as_str()))
    }

    async fn build_client(&self) -> Client {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.config.region.clone()))
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(Duration::from_secs(self.config.timeout_secs))
                    .build(),
            );

        // Static keys win; the default provider chain covers instance roles and env.
        if !self.config.access_key.is_empty() {
            loader = loader.credentials_provider(Credentials::new(
                &self.config.access_key,
                &self.config.secret_key,
                None,
                None,
                "tablesnap",
            ));
        }

        let shared = loader.load().await;
        let mut builder =
            S3ConfigBuilder::from(&shared).force_path_style(self.config.force_path_style);
        if let Some(endpoint) = self.endpoint() {
            builder = builder.endpoint_url(endpoint);
        }
        if self.config.disable_cert_verification {
            warn!("S3 certificate verification is disabled");
            builder = builder.http_client(insecure_http_client());
        }

        Client::from_conf(builder.build())
    }

    async fn multipart_upload(
        &self,
        client: &Client,
        bucket: &str,
        full_key: &str,
        reader: &mut BoxReader,
        first: Bytes,
    ) -> Result<()> {
        let created = client
            .create_multipart_upload()
            .bucket(bucket)
            .key(full_key)
            .set_acl(self.acl())
            .set_server_side_encryption(self.sse())
            .send()
            .await
            .map_err(s3_error)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::Other("No upload ID returned".to_string()))?
            .to_string();

        let uploaded = upload_parts(
            reader,
            full_key,
            first,
            self.config.part_size,
            self.config.concurrency,
            |number, body| {
                let request = client
                    .upload_part()
                    .bucket(bucket)
                    .key(full_key)
                    .upload_id(&upload_id)
                    .part_number(number)
                    .body(ByteStream::from(body));
                async move {
                    let part = request.send().await.map_err(s3_error)?;
                    Ok(part.e_tag().unwrap_or_default().to_string())
                }
            },
        )
        .await;

        let parts = match uploaded {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(abort) = client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(full_key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = full_key,
                        error = %DisplayErrorContext(&abort),
                        "Failed to abort multipart upload"
                    );
                }
                return Err(e);
            }
        };

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|part| {
                        CompletedPart::builder()
                            .part_number(part.number)
                            .e_tag(part.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(full_key)
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(s3_error)?;

        Ok(())
    }
}

#[async_trait]
impl RemoteStorage for S3Backend {
    async fn connect(&mut self, override_bucket: &str) -> Result<()> {
        let bucket = pick(&self.config.bucket, override_bucket).to_string();
        let client = self.build_client().await;

        client
            .head_bucket()
            .bucket(&bucket)
            .send()
            .await
            .map_err(|e| Error::Connection {
                kind: KIND,
                message: format!("bucket {} not accessible: {}", bucket, DisplayErrorContext(&e)),
            })?;

        info!(bucket = %bucket, region = %self.config.region, "Connected to S3");
        self.client = Some(client);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    async fn get_file(&self, key: &str, override_bucket: &str) -> Result<RemoteFile> {
        let full_key = self.full_key(key);
        let result = self
            .client()?
            .head_object()
            .bucket(pick(&self.config.bucket, override_bucket))
            .key(&full_key)
            .send()
            .await;

        match result {
            Ok(head) => Ok(RemoteFile::new(
                key,
                head.content_length().unwrap_or(0),
                to_utc(head.last_modified()),
            )),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => {
                Err(Error::not_found(key))
            }
            Err(e) => Err(s3_error(e)),
        }
    }

    async fn get_file_reader(&self, key: &str, override_bucket: &str) -> Result<BoxReader> {
        let full_key = self.full_key(key);
        let response = self
            .client()?
            .get_object()
            .bucket(pick(&self.config.bucket, override_bucket))
            .key(&full_key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_no_such_key()) {
                    Error::not_found(key)
                } else {
                    s3_error(e)
                }
            })?;

        Ok(Box::pin(response.body.into_async_read()))
    }

    async fn put_file(
        &self,
        key: &str,
        override_bucket: &str,
        mut reader: BoxReader,
    ) -> Result<()> {
        let client = self.client()?;
        let bucket = pick(&self.config.bucket, override_bucket);
        let full_key = self.full_key(&self.upload_key(key));

        let first = read_part(&mut reader, &full_key, self.config.part_size).await?;
        if first.len() < self.config.part_size {
            debug!(key = %full_key, size = first.len(), "Single request upload");
            client
                .put_object()
                .bucket(bucket)
                .key(&full_key)
                .set_acl(self.acl())
                .set_server_side_encryption(self.sse())
                .body(ByteStream::from(first))
                .send()
                .await
                .map_err(s3_error)?;
            return Ok(());
        }

        debug!(key = %full_key, part_size = self.config.part_size, "Multipart upload");
        self.multipart_upload(client, bucket, &full_key, &mut reader, first).await
    }

    async fn delete_file(&self, key: &str, override_bucket: &str) -> Result<()> {
        // DeleteObject succeeds on absent keys, so probe first.
        self.get_file(key, override_bucket).await?;

        let full_key = self.full_key(key);
        self.client()?
            .delete_object()
            .bucket(pick(&self.config.bucket, override_bucket))
            .key(&full_key)
            .send()
            .await
            .map_err(s3_error)?;
        debug!(key = %full_key, "Deleted object");
        Ok(())
    }

    async fn walk(
        &self,
        path: &str,
        override_bucket: &str,
        override_path: &str,
        visit: &mut (dyn FnMut(RemoteFile) + Send),
    ) -> Result<()> {
        let base = pick(&self.config.path, override_path).to_string();
        let pages = S3Pages {
            client: self.client()?.clone(),
            bucket: pick(&self.config.bucket, override_bucket).to_string(),
            prefix: join_key(&base, path),
            base,
            token: None,
            done: false,
        };
        let deadline = Duration::from_secs(self.config.timeout_secs);
        walk_with_deadline(KIND, Some(deadline), |sink| drain_pages(pages, sink), visit).await
    }
}

/// ListObjectsV2 pages; the continuation token never leaves this struct.
struct S3Pages {
    client: Client,
    bucket: String,
    prefix: String,
    base: String,
    token: Option<String>,
    done: bool,
}

#[async_trait]
impl PageSource for S3Pages {
    async fn next_page(&mut self) -> Result<Option<Vec<RemoteFile>>> {
        if self.done {
            return Ok(None);
        }

        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(LIST_PAGE_SIZE)
            .set_continuation_token(self.token.take());
        if !self.prefix.is_empty() && self.prefix != "/" {
            request = request.prefix(&self.prefix);
        }

        let page = request.send().await.map_err(s3_error)?;
        let files = page
            .contents()
            .iter()
            .filter_map(|object| {
                let key = object.key()?;
                Some(RemoteFile::new(
                    strip_prefix(&self.base, key),
                    object.size().unwrap_or(0),
                    to_utc(object.last_modified()),
                ))
            })
            .collect();

        match page.next_continuation_token() {
            Some(token) if page.is_truncated().unwrap_or(false) => {
                self.token = Some(token.to_string());
            }
            _ => self.done = true,
        }
        Ok(Some(files))
    }
}

fn s3_error<E>(err: SdkError<E>) -> Error
where
    S3Error: From<SdkError<E>>,
{
    Error::backend(KIND, S3Error::from(err))
}

fn to_utc(time: Option<&S3DateTime>) -> DateTime<Utc> {
    time.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

/// HTTP client that accepts any server certificate, for self-signed endpoints.
fn insecure_http_client() -> SharedHttpClient {
    let tls = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();
    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .build();
    HyperClientBuilder::new().build(connector)
}

struct AcceptAnyCertificate;

impl rustls::client::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
