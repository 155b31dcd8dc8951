use std::{error::Error as _, time::Duration};

use anyhow::Result;
use reqwest::{
    header::{CONTENT_TYPE, RETRY_AFTER},
    Client, ClientBuilder,
};
use url::Url;

use crate::{
    errors::TransportError,
    transport::{Transport, TransportResponse},
};

const USER_AGENT: &str = concat!("hivesync/", env!("CARGO_PKG_VERSION"));
const RATELIMIT_HEADER: &str = "ratelimit";

/// JSON-RPC over HTTP(S) to a single node.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http_client: Client,
    url: Url,
}

impl HttpTransport {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http_client: ClientBuilder::new()
                .timeout(timeout)
                .user_agent(USER_AGENT)
                .build()?,
            url,
        })
    }
}

impl Transport for HttpTransport {
    async fn post(&self, body: String) -> Result<TransportResponse, TransportError> {
        let response = self
            .http_client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(classify)?;

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let status = response.status().as_u16();
        let ratelimit = header(RATELIMIT_HEADER);
        let retry_after = header(RETRY_AFTER.as_str());

        let body = response.text().await.map_err(classify)?;
        Ok(TransportResponse {
            status,
            ratelimit,
            retry_after,
            body,
        })
    }
}

fn classify(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        return TransportError::Timeout;
    }

    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string().to_lowercase();
        if text.contains("certificate") || text.contains("tls") || text.contains("handshake") {
            return TransportError::Tls(cause.to_string());
        }
        source = cause.source();
    }

    TransportError::Http(error.to_string())
}
