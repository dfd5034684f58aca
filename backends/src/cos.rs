use crate::backend::{embedding_hostname, not_connected, pick, BoxReader, RemoteStorage};
use crate::transfer::{read_part, upload_parts, CompletedPart};
use crate::walk::{drain_pages, walk_with_deadline, PageSource};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, ETAG, LAST_MODIFIED};
use reqwest::{Client, Method, Response};
use sha1::{Digest, Sha1};
use std::io;
use std::time::Duration;
use tablesnap_core::config::CosConfig;
use tablesnap_core::{embed_hostname, join_key, strip_prefix, Error, RemoteFile, Result};
use thiserror::Error as ThisError;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};
use url::Url;

const KIND: &str = "COS";
const LIST_PAGE_SIZE: &str = "1000";
const SIGNATURE_TTL_SECS: i64 = 3600;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, ThisError)]
pub enum CosError {
    #[error("COS request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("COS returned {status}: {code} {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },

    #[error("malformed COS response: {0}")]
    Malformed(String),
}

impl CosError {
    fn is_not_found(&self) -> bool {
        match self {
            CosError::Service { status, code, .. } => {
                code == "NoSuchKey" || (*status == 404 && code != "NoSuchBucket")
            }
            _ => false,
        }
    }
}

/// Signed HTTP access to COS. Cheap to clone into part upload tasks.
#[derive(Clone)]
struct Session {
    client: Client,
    secret_id: String,
    secret_key: String,
    debug: bool,
}

impl Session {
    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<Bytes>,
    ) -> std::result::Result<Response, CosError> {
        let now = Utc::now().timestamp();
        let expires = now + SIGNATURE_TTL_SECS;
        let authorization = sign(&self.secret_id, &self.secret_key, &method, &url, now, expires);

        if self.debug {
            debug!(method = %method, url = %url, "COS request");
        }
        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .header(AUTHORIZATION, authorization);
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request.send().await?;
        if self.debug {
            debug!(
                method = %method,
                url = %url,
                status = %response.status(),
                headers = ?response.headers(),
                "COS response"
            );
        }

        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(CosError::Service {
            status,
            code: xml_value(&body, "Code").unwrap_or_default(),
            message: xml_value(&body, "Message").unwrap_or_default(),
        })
    }
}

/// Tencent Cloud Object Storage over its REST API.
///
/// Requests carry a `q-sign-algorithm=sha1` authorization valid for one
/// hour from the moment they are built. `url` is the bucket URL; an
/// `override_bucket` is another bucket URL.
pub struct CosBackend {
    config: CosConfig,
    session: Option<(Url, Session)>,
    hostname: Option<String>,
}

impl CosBackend {
    pub fn new(config: CosConfig) -> Self {
        let hostname = embedding_hostname(config.path_hostname_include);
        Self {
            config,
            session: None,
            hostname,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    fn session(&self, override_bucket: &str) -> Result<(Url, &Session)> {
        let (bucket, session) = self.session.as_ref().ok_or_else(|| not_connected(KIND))?;
        if override_bucket.is_empty() {
            Ok((bucket.clone(), session))
        } else {
            Ok((parse_bucket_url(override_bucket)?, session))
        }
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

    async fn multipart_upload(
        &self,
        session: &Session,
        bucket: &Url,
        key: &str,
        full_key: &str,
        reader: &mut BoxReader,
        first: Bytes,
    ) -> Result<()> {
        let initiated = session
            .send(Method::POST, object_url(bucket, full_key, &[("uploads", "")]), None)
            .await
            .map_err(|e| cos_error(e, key))?
            .text()
            .await
            .map_err(|e| Error::backend(KIND, e))?;
        let upload_id = xml_value(&initiated, "UploadId")
            .ok_or_else(|| {
                Error::backend(KIND, CosError::Malformed("no UploadId returned".to_string()))
            })?;

        let uploaded = upload_parts(
            reader,
            full_key,
            first,
            self.config.part_size,
            self.config.concurrency,
            |number, body| {
                let session = session.clone();
                let number = number.to_string();
                let url = object_url(
                    bucket,
                    full_key,
                    &[("partNumber", number.as_str()), ("uploadId", upload_id.as_str())],
                );
                let key = key.to_string();
                async move {
                    let response = session
                        .send(Method::PUT, url, Some(body))
                        .await
                        .map_err(|e| cos_error(e, &key))?;
                    let etag = response
                        .headers()
                        .get(ETAG)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    Ok(etag)
                }
            },
        )
        .await;

        let parts = match uploaded {
            Ok(parts) => parts,
            Err(e) => {
                let abort = object_url(bucket, full_key, &[("uploadId", upload_id.as_str())]);
                if let Err(abort) = session.send(Method::DELETE, abort, None).await {
                    warn!(key = full_key, error = %abort, "Failed to abort multipart upload");
                }
                return Err(e);
            }
        };

        session
            .send(
                Method::POST,
                object_url(bucket, full_key, &[("uploadId", upload_id.as_str())]),
                Some(Bytes::from(complete_multipart_body(&parts))),
            )
            .await
            .map_err(|e| cos_error(e, key))?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStorage for CosBackend {
    async fn connect(&mut self, override_bucket: &str) -> Result<()> {
        let raw = if override_bucket.is_empty() {
            self.config.url.as_str()
        } else {
            override_bucket
        };
        let bucket = parse_bucket_url(raw)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .danger_accept_invalid_certs(self.config.disable_cert_verification)
            .build()
            .map_err(|e| Error::Connection {
                kind: KIND,
                message: e.to_string(),
            })?;
        let session = Session {
            client,
            secret_id: self.config.secret_id.clone(),
            secret_key: self.config.secret_key.clone(),
            debug: self.config.debug,
        };

        session
            .send(Method::HEAD, object_url(&bucket, "", &[]), None)
            .await
            .map_err(|e| Error::Connection {
                kind: KIND,
                message: format!("bucket {} not accessible: {}", bucket, e),
            })?;

        info!(bucket = %bucket, "Connected to COS");
        self.session = Some((bucket, session));
        Ok(())
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    async fn get_file(&self, key: &str, override_bucket: &str) -> Result<RemoteFile> {
        let (bucket, session) = self.session(override_bucket)?;
        let full_key = self.full_key(key);
        let response = session
            .send(Method::HEAD, object_url(&bucket, &full_key, &[]), None)
            .await
            .map_err(|e| cos_error(e, key))?;

        let headers = response.headers();
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let last_modified = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Ok(RemoteFile::new(key, size, last_modified))
    }

    async fn get_file_reader(&self, key: &str, override_bucket: &str) -> Result<BoxReader> {
        let (bucket, session) = self.session(override_bucket)?;
        let full_key = self.full_key(key);
        let response = session
            .send(Method::GET, object_url(&bucket, &full_key, &[]), None)
            .await
            .map_err(|e| cos_error(e, key))?;
        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn put_file(
        &self,
        key: &str,
        override_bucket: &str,
        mut reader: BoxReader,
    ) -> Result<()> {
        let (bucket, session) = self.session(override_bucket)?;
        let key = self.upload_key(key);
        let full_key = self.full_key(&key);

        let first = read_part(&mut reader, &key, self.config.part_size).await?;
        if first.len() < self.config.part_size {
            debug!(key = %full_key, size = first.len(), "Single request upload");
            session
                .send(Method::PUT, object_url(&bucket, &full_key, &[]), Some(first))
                .await
                .map_err(|e| cos_error(e, &key))?;
            return Ok(());
        }

        debug!(key = %full_key, part_size = self.config.part_size, "Multipart upload");
        self.multipart_upload(session, &bucket, &key, &full_key, &mut reader, first)
            .await
    }

    async fn delete_file(&self, key: &str, override_bucket: &str) -> Result<()> {
        // DELETE succeeds on absent keys, so probe first.
        self.get_file(key, override_bucket).await?;

        let (bucket, session) = self.session(override_bucket)?;
        let full_key = self.full_key(key);
        session
            .send(Method::DELETE, object_url(&bucket, &full_key, &[]), None)
            .await
            .map_err(|e| cos_error(e, key))?;
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
        let (bucket, session) = self.session(override_bucket)?;
        let base = pick(&self.config.path, override_path).to_string();
        let pages = CosPages {
            session: session.clone(),
            bucket,
            prefix: join_key(&base, path),
            base,
            marker: None,
            done: false,
        };
        let deadline = Duration::from_secs(self.config.timeout_secs);
        walk_with_deadline(KIND, Some(deadline), |sink| drain_pages(pages, sink), visit).await
    }
}

/// GET Bucket pages, advanced by marker.
struct CosPages {
    session: Session,
    bucket: Url,
    prefix: String,
    base: String,
    marker: Option<String>,
    done: bool,
}

#[async_trait]
impl PageSource for CosPages {
    async fn next_page(&mut self) -> Result<Option<Vec<RemoteFile>>> {
        if self.done {
            return Ok(None);
        }

        let marker = self.marker.take().unwrap_or_default();
        let mut params = vec![("max-keys", LIST_PAGE_SIZE)];
        if !self.prefix.is_empty() {
            params.push(("prefix", self.prefix.as_str()));
        }
        if !marker.is_empty() {
            params.push(("marker", marker.as_str()));
        }

        let body = self
            .session
            .send(Method::GET, object_url(&self.bucket, "", &params), None)
            .await
            .map_err(|e| Error::backend(KIND, e))?
            .text()
            .await
            .map_err(|e| Error::backend(KIND, e))?;

        let page = parse_list_page(&body, &self.base);
        match page.next_marker {
            Some(next) if page.truncated => self.marker = Some(next),
            _ => self.done = true,
        }
        Ok(Some(page.files))
    }
}

struct ListPage {
    files: Vec<RemoteFile>,
    truncated: bool,
    next_marker: Option<String>,
}

fn parse_list_page(xml: &str, base: &str) -> ListPage {
    let mut last_key = None;
    let files = xml_elements(xml, "Contents")
        .into_iter()
        .filter_map(|contents| {
            let key = xml_value(contents, "Key")?;
            let size = xml_value(contents, "Size")
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            let last_modified = xml_value(contents, "LastModified")
                .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            let file = RemoteFile::new(strip_prefix(base, &key), size, last_modified);
            last_key = Some(key);
            Some(file)
        })
        .collect();

    ListPage {
        files,
        truncated: xml_value(xml, "IsTruncated").as_deref() == Some("true"),
        // NextMarker is only returned with a delimiter; fall back to the last key.
        next_marker: xml_value(xml, "NextMarker")
            .filter(|m| !m.is_empty())
            .or(last_key),
    }
}

fn parse_bucket_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| Error::Validation(format!("invalid COS bucket URL {:?}: {}", raw, e)))?;
    if url.host_str().is_none() {
        return Err(Error::Validation(format!("COS bucket URL {:?} has no host", raw)));
    }
    Ok(url)
}

/// `bucket` with `key` as its path, every segment percent-encoded.
fn object_url(bucket: &Url, key: &str, params: &[(&str, &str)]) -> Url {
    let mut url = bucket.clone();
    let path: Vec<_> = key.split('/').map(urlencoding::encode).collect();
    url.set_path(&format!("/{}", path.join("/")));
    if params.is_empty() {
        url.set_query(None);
    } else {
        let query: Vec<_> = params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect();
        url.set_query(Some(&query.join("&")));
    }
    url
}

/// Builds the `Authorization` header value for a request to `url`.
///
/// Only the `host` header is signed; every query parameter is.
fn sign(
    secret_id: &str,
    secret_key: &str,
    method: &Method,
    url: &Url,
    start: i64,
    end: i64,
) -> String {
    let key_time = format!("{};{}", start, end);
    let sign_key = hex::encode(hmac_sha1(secret_key.as_bytes(), key_time.as_bytes()));

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            (
                urlencoding::encode(&k.to_lowercase()).into_owned(),
                urlencoding::encode(&v).into_owned(),
            )
        })
        .collect();
    params.sort();
    let param_list = params.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>().join(";");
    let param_string = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    };
    let path = urlencoding::decode(url.path())
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| url.path().to_string());

    let http_string = format!(
        "{}\n{}\n{}\nhost={}\n",
        method.as_str().to_lowercase(),
        path,
        param_string,
        urlencoding::encode(&host)
    );
    let string_to_sign = format!(
        "sha1\n{}\n{}\n",
        key_time,
        hex::encode(Sha1::digest(http_string.as_bytes()))
    );
    let signature = hex::encode(hmac_sha1(sign_key.as_bytes(), string_to_sign.as_bytes()));

    format!(
        "q-sign-algorithm=sha1&q-ak={}&q-sign-time={}&q-key-time={}\
         &q-header-list=host&q-url-param-list={}&q-signature={}",
        secret_id, key_time, key_time, param_list, signature
    )
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn complete_multipart_body(parts: &[CompletedPart]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.number,
            xml_escape(&part.etag)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

fn cos_error(err: CosError, key: &str) -> Error {
    if err.is_not_found() {
        Error::not_found(key)
    } else {
        Error::backend(KIND, err)
    }
}

/// Inner text of every `<tag>...</tag>` element, in document order.
fn xml_elements<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut found = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        found.push(&after[..end]);
        rest = &after[end + close.len()..];
    }
    found
}

fn xml_value(xml: &str, tag: &str) -> Option<String> {
    xml_elements(xml, tag).first().map(|v| xml_unescape(v))
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
