//! HTTP client side of the StoreAPI, one instance per configured endpoint.

use std::time::Duration;

use anyhow::{bail, Error};
use futures::future::BoxFuture;
use prost::Message;

use super::federator::StoreClient;
use crate::store::proto;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpStoreClient {
    endpoint: String,
    client: hyper::Client<hyper::client::HttpConnector>,
    timeout: Duration,
}

impl HttpStoreClient {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: hyper::Client::new(),
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn request(&self, method: &str, path: &str, body: Vec<u8>) -> Result<Vec<u8>, Error> {
        let request = hyper::Request::builder()
            .method(method)
            .uri(format!("{}{}", self.endpoint, path))
            .header(hyper::header::CONTENT_TYPE, "application/x-protobuf")
            .body(hyper::Body::from(body))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| anyhow::format_err!("request to {} timed out", self.endpoint))??;

        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        if !status.is_success() {
            bail!(
                "store {} returned {}: {}",
                self.endpoint,
                status,
                String::from_utf8_lossy(&bytes)
            );
        }
        Ok(bytes.to_vec())
    }
}

impl StoreClient for HttpStoreClient {
    fn name(&self) -> &str {
        &self.endpoint
    }

    fn info<'a>(&'a self) -> BoxFuture<'a, Result<proto::InfoResponse, Error>> {
        Box::pin(async move {
            let bytes = self.request("GET", "/api/v1/store/info", Vec::new()).await?;
            Ok(proto::InfoResponse::decode(&bytes[..])?)
        })
    }

    fn series<'a>(
        &'a self,
        req: &'a proto::SeriesRequest,
    ) -> BoxFuture<'a, Result<Vec<proto::SeriesResponse>, Error>> {
        Box::pin(async move {
            let bytes = self
                .request("POST", "/api/v1/store/series", req.encode_to_vec())
                .await?;
            proto::decode_frames(&bytes)
        })
    }

    fn label_names<'a>(
        &'a self,
        req: &'a proto::LabelNamesRequest,
    ) -> BoxFuture<'a, Result<proto::LabelNamesResponse, Error>> {
        Box::pin(async move {
            let bytes = self
                .request("POST", "/api/v1/store/label_names", req.encode_to_vec())
                .await?;
            Ok(proto::LabelNamesResponse::decode(&bytes[..])?)
        })
    }

    fn label_values<'a>(
        &'a self,
        req: &'a proto::LabelValuesRequest,
    ) -> BoxFuture<'a, Result<proto::LabelValuesResponse, Error>> {
        Box::pin(async move {
            let bytes = self
                .request("POST", "/api/v1/store/label_values", req.encode_to_vec())
                .await?;
            Ok(proto::LabelValuesResponse::decode(&bytes[..])?)
        })
    }
}
