use reqwest::{Client, header};
use url::Url;

use crate::error::IndexingError;
use crate::item::ItemMetadata;

const AUTH_HEADER: &str = "X-Auth-Token";

/// HTTP client for the remote feature-extraction service.
#[derive(Clone)]
pub struct IndexerClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl IndexerClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, IndexingError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Indexes one item. When `raw_bytes` is present the local file content is
    /// uploaded first so the service does not have to fetch it itself.
    pub async fn index(
        &self,
        item: &ItemMetadata,
        raw_bytes: Option<Vec<u8>>,
        user_agent: &str,
    ) -> Result<(), IndexingError> {
        if let Some(bytes) = raw_bytes {
            let url = self.endpoint(&format!("/v1/ml/files/{}/source", item.id))?;
            let response = self
                .http
                .put(url)
                .header(AUTH_HEADER, &self.token)
                .header(header::USER_AGENT, user_agent)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(bytes)
                .send()
                .await?;
            Self::check_response(response).await?;
        }

        let url = self.endpoint(&format!("/v1/ml/files/{}/index", item.id))?;
        let response = self
            .http
            .post(url)
            .header(AUTH_HEADER, &self.token)
            .header(header::USER_AGENT, user_agent)
            .json(item)
            .send()
            .await?;
        Self::check_response(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, IndexingError> {
        Ok(self.base_url.join(path)?)
    }

    async fn check_response(response: reqwest::Response) -> Result<(), IndexingError> {
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(IndexingError::Http { status, body })
        }
    }
}
