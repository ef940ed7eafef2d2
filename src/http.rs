//! POST-JSON side-channel used for credential refresh and private-channel
//! authorization. Injected behind a trait so the session core is testable
//! without sockets and without a process-wide HTTP singleton.

use std::collections::HashMap;

use futures_util::future::BoxFuture;
use sonic_rs::Value;

use crate::core::types::{ClientError, ClientResult};

pub trait HttpPoster: Send + Sync + 'static {
    /// POST `body` as JSON to `url` with extra headers and query params;
    /// resolve with the parsed JSON response on a 2xx status.
    fn post_json(
        &self,
        url: String,
        headers: HashMap<String, String>,
        params: HashMap<String, String>,
        body: Value,
    ) -> BoxFuture<'static, ClientResult<Value>>;
}

#[derive(Clone)]
pub struct ReqwestPoster {
    client: reqwest::Client,
}

impl Default for ReqwestPoster {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl ReqwestPoster {
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HttpPoster for ReqwestPoster {
    fn post_json(
        &self,
        url: String,
        headers: HashMap<String, String>,
        params: HashMap<String, String>,
        body: Value,
    ) -> BoxFuture<'static, ClientResult<Value>> {
        let client = self.client.clone();
        Box::pin(async move {
            let mut request = client.post(&url).query(&params).json(&body);
            for (name, value) in &headers {
                request = request.header(name, value);
            }

            let response = request
                .send()
                .await
                .map_err(|e| ClientError::Http(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(ClientError::Http(format!("{url} returned {status}")));
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| ClientError::Http(e.to_string()))?;
            sonic_rs::from_slice(&bytes)
                .map_err(|e| ClientError::Http(format!("invalid json from {url}: {e}")))
        })
    }
}
