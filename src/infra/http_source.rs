use crate::app::ports::{MessageSource, SourceMedia, SourcePage};
use crate::error::{IngestError, Result, SourceError};
use crate::types::Cursor;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode, Url};
use std::time::Duration;
use tracing::debug;

/// Message source backed by the channel platform's HTTP read API.
///
/// `GET {base_url}/channels/{channel}/messages?after={cursor}&limit={n}`
pub struct HttpMessageSource {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpMessageSource {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("channel_ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(IngestError::Http)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn media_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }

    /// Whether `url` shares scheme, host and port with the API base.
    fn same_origin(&self, url: &str) -> bool {
        match (Url::parse(&self.base_url), Url::parse(url)) {
            (Ok(base), Ok(target)) => base.origin() == target.origin(),
            _ => false,
        }
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> std::result::Result<Response, SourceError> {
        let mut req = self.client.get(url).query(query);
        // the token is only for the API; media may live on a CDN
        if let Some(token) = self.token.as_ref().filter(|_| self.same_origin(url)) {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let resp = req.send().await?;
        classify(resp)
    }
}

/// Map an HTTP status onto the retry classification used by the scraper.
fn classify(resp: Response) -> std::result::Result<Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(SourceError::RateLimited { retry_after });
    }
    Err(status_error(status))
}

fn status_error(status: StatusCode) -> SourceError {
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        SourceError::Transient(format!("upstream returned {status}"))
    } else {
        SourceError::Permanent(format!("upstream returned {status}"))
    }
}

#[async_trait]
impl MessageSource for HttpMessageSource {
    async fn fetch_page(
        &self,
        channel: &str,
        after: Option<Cursor>,
        limit: usize,
    ) -> std::result::Result<SourcePage, SourceError> {
        let url = format!("{}/channels/{}/messages", self.base_url, channel);
        let mut query = vec![("limit", limit.to_string())];
        if let Some(after) = after {
            query.push(("after", after.0.to_string()));
        }
        let page: SourcePage = self.get(&url, &query).await?.json().await?;
        debug!(
            "Fetched {} messages for {} after {:?}",
            page.messages.len(),
            channel,
            after
        );
        Ok(page)
    }

    async fn fetch_media(&self, media: &SourceMedia) -> std::result::Result<Vec<u8>, SourceError> {
        let resp = self.get(&self.media_url(&media.url), &[]).await?;
        Ok(resp.bytes().await?.to_vec())
    }
}
