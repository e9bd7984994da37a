//! services/api/src/adapters/blob.rs
//!
//! Object-storage adapter speaking the `{base}/object/{bucket}/{path}` HTTP API.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use study_core::ports::{BlobStore, PortError, PortResult};
use tracing::debug;

#[derive(Clone)]
pub struct HttpBlobStore {
    client: Client,
    base_url: String,
    bucket: String,
    service_key: Option<String>,
}

impl HttpBlobStore {
    pub fn new(client: Client, base_url: &str, bucket: &str, service_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            service_key,
        }
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/object/{}/{}", self.base_url, self.bucket, path.trim_start_matches('/'))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.service_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

fn status_error(status: StatusCode, path: &str, body: String) -> PortError {
    match status {
        StatusCode::NOT_FOUND => PortError::NotFound(format!("object '{}'", path)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PortError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => PortError::RateLimited(body),
        s => PortError::Upstream {
            status: s.as_u16(),
            message: body,
        },
    }
}

fn transport_error(e: reqwest::Error) -> PortError {
    if e.is_timeout() {
        PortError::Upstream {
            status: 504,
            message: e.to_string(),
        }
    } else if e.is_connect() {
        PortError::Upstream {
            status: 503,
            message: e.to_string(),
        }
    } else {
        PortError::Unexpected(e.to_string())
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, path: &str, data: Bytes, content_type: &str) -> PortResult<String> {
        let request = self
            .client
            .post(self.object_url(path))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(data);
        let response = self.authorized(request).send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, path, body));
        }
        debug!(path, "Uploaded object");
        Ok(path.to_string())
    }

    async fn download(&self, path: &str) -> PortResult<Bytes> {
        let request = self.client.get(self.object_url(path));
        let response = self.authorized(request).send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, path, body));
        }
        response.bytes().await.map_err(transport_error)
    }
}
