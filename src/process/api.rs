//! HTTP side of the process API: starting and terminating remote processes.

use std::time::Duration;

use url::Url;

use crate::error::ClientError;
use crate::protocol::{StartRequest, StartResponse, StatusResponse, Token};

#[derive(Clone)]
pub(crate) struct ProcessApi {
    http: reqwest::Client,
    endpoint: Url,
    token: Option<String>,
}

impl ProcessApi {
    pub(crate) fn new(endpoint: Url, token: Option<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            endpoint,
            token,
        })
    }

    /// `POST {endpoint}`. Returns the token the server assigned.
    pub(crate) async fn start(&self, request: &StartRequest) -> Result<Token, ClientError> {
        let mut req = self.http.post(self.endpoint.clone()).json(request);
        if let Some(t) = &self.token {
            req = req.bearer_auth(t);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(remote_error(resp).await);
        }
        let body: StartResponse = resp.json().await?;
        Ok(body.token)
    }

    /// `DELETE {endpoint}/{token}`.
    pub(crate) async fn terminate(&self, token: &str) -> Result<(), ClientError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::UnsupportedScheme(self.endpoint.scheme().to_string()))?
            .pop_if_empty()
            .push(token);

        let mut req = self.http.delete(url);
        if let Some(t) = &self.token {
            req = req.bearer_auth(t);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(remote_error(resp).await);
        }
        Ok(())
    }
}

/// Turn a non-success response into `ClientError::Remote`, using the body's
/// `status` keyword when there is one.
async fn remote_error(resp: reqwest::Response) -> ClientError {
    let code = resp.status();
    let status = match resp.json::<StatusResponse>().await {
        Ok(body) => body.status,
        Err(_) => code
            .canonical_reason()
            .map(|r| r.to_lowercase().replace(' ', "_"))
            .unwrap_or_else(|| code.as_u16().to_string()),
    };
    ClientError::Remote {
        code: code.as_u16(),
        status,
    }
}
