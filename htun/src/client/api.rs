//! Typed calls to the tunnel server's HTTP operations.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use reqwest_hickory_resolver::HickoryResolver;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::credentials::Credentials;
use super::error::ClientError;
use crate::transport::Reply;

/// Timeout for the short control calls; connect, send and receive have none.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("htun/", env!("CARGO_PKG_VERSION"));

/// HTTP client configured the way every tunnel call expects: no redirects,
/// a recognizable user agent and the hickory resolver.
pub fn http_client() -> Result<reqwest::Client, ClientError> {
    let resolver = Arc::new(HickoryResolver::default());
    let client = reqwest::Client::builder()
        .dns_resolver(resolver)
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(USER_AGENT)
        .build()?;
    Ok(client)
}

/// Server status as returned by `/status?format=json`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusReport {
    pub connections: Vec<ConnectionStatus>,
    pub events: Vec<EventEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionStatus {
    pub id: String,
    pub destination: String,
    pub user: String,
    pub created_at: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventEntry {
    pub connection_id: String,
    pub status: String,
    pub details: String,
    pub timestamp: String,
}

/// One tunnel server, optionally with the credentials to use on it.
///
/// Credentials are sent with every request rather than after a challenge.
#[derive(Debug, Clone)]
pub struct ProxyApi {
    http: reqwest::Client,
    base: Url,
    credentials: Option<Credentials>,
}

impl ProxyApi {
    pub fn new(http: reqwest::Client, base: &str) -> Result<Self, ClientError> {
        let base = Url::parse(base.trim()).map_err(|e| ClientError::InvalidUrl(format!("{base}: {e}")))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(ClientError::InvalidUrl(base.to_string()));
        }
        Ok(Self {
            http,
            base,
            credentials: None,
        })
    }

    pub fn with_credentials(&self, credentials: Credentials) -> Self {
        Self {
            credentials: Some(credentials),
            ..self.clone()
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Host and path of the server, used as the target when asking for
    /// credentials.
    pub fn target(&self) -> String {
        let mut target = self.base.host_str().unwrap_or_default().to_owned();
        if let Some(port) = self.base.port() {
            target.push_str(&format!(":{port}"));
        }
        target.push_str(self.base.path().trim_end_matches('/'));
        target
    }

    pub fn url(&self, operation: &str, params: &[(&str, &str)]) -> Result<Url, ClientError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .push(operation);
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.credentials {
            Some(credentials) => builder.basic_auth(&credentials.username, Some(&credentials.password)),
            None => builder,
        }
    }

    /// Checks the credentials. `Ok(false)` means the server rejected them.
    pub async fn authenticate(&self) -> Result<bool, ClientError> {
        let response = self
            .request(Method::GET, self.url("auth", &[])?)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::UNAUTHORIZED => Ok(false),
            status => Err(unexpected(status, response).await),
        }
    }

    /// Opens a connection to `host:port` and returns its id.
    pub async fn connect(&self, host: &str, port: u16) -> Result<String, ClientError> {
        let port = port.to_string();
        let url = self.url("connect", &[("host", host), ("port", &port)])?;
        let response = self.request(Method::GET, url).send().await?;
        match response.status() {
            StatusCode::OK => match expect_reply(response).await? {
                Reply::Open(id) => Ok(id),
                other => Err(ClientError::Garbled(other.to_string())),
            },
            StatusCode::INTERNAL_SERVER_ERROR => {
                Err(ClientError::ConnectFailed(error_message(response).await))
            }
            status => Err(unexpected(status, response).await),
        }
    }

    /// Writes `data` to the connection and returns how much the server took.
    pub async fn send(&self, id: &str, data: Bytes) -> Result<u64, ClientError> {
        let len = data.len() as u64;
        let response = self
            .request(Method::POST, self.url("send", &[("id", id)])?)
            .header(CONTENT_TYPE, mime::APPLICATION_OCTET_STREAM.as_ref())
            .body(data)
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => match expect_reply(response).await? {
                Reply::Received(n) if n == len => Ok(n),
                other => Err(ClientError::Garbled(other.to_string())),
            },
            StatusCode::NOT_FOUND => Err(ClientError::Closed(error_message(response).await)),
            status => Err(unexpected(status, response).await),
        }
    }

    /// Keeps the connection from expiring.
    pub async fn ping(&self, id: &str) -> Result<(), ClientError> {
        let response = self
            .request(Method::GET, self.url("ping", &[("id", id)])?)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => match expect_reply(response).await? {
                Reply::Active => Ok(()),
                other => Err(ClientError::Garbled(other.to_string())),
            },
            StatusCode::NOT_FOUND => Err(ClientError::Closed(format!("connection {id}"))),
            status => Err(unexpected(status, response).await),
        }
    }

    pub async fn disconnect(&self, id: &str) -> Result<(), ClientError> {
        let response = self
            .request(Method::GET, self.url("disconnect", &[("id", id)])?)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => match expect_reply(response).await? {
                Reply::Closed => Ok(()),
                other => Err(ClientError::Garbled(other.to_string())),
            },
            status => Err(unexpected(status, response).await),
        }
    }

    /// Starts the receive stream. The body still begins with the marker line.
    pub async fn receive(&self, id: &str) -> Result<Response, ClientError> {
        let response = self
            .request(Method::GET, self.url("receive", &[("id", id)])?)
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => {
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<mime::Mime>().ok());
                match content_type {
                    Some(mime) if mime.essence_str() == mime::APPLICATION_OCTET_STREAM.essence_str() => {
                        Ok(response)
                    }
                    other => Err(ClientError::Garbled(format!(
                        "receive stream with content type {other:?}"
                    ))),
                }
            }
            StatusCode::NOT_FOUND => Err(ClientError::Closed(error_message(response).await)),
            status => Err(unexpected(status, response).await),
        }
    }

    pub async fn status(&self) -> Result<StatusReport, ClientError> {
        let response = self
            .request(Method::GET, self.url("status", &[("format", "json")])?)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            status => Err(unexpected(status, response).await),
        }
    }

    /// The status dump exactly as the server renders it.
    pub async fn status_text(&self, json: bool) -> Result<String, ClientError> {
        let params: &[(&str, &str)] = if json { &[("format", "json")] } else { &[] };
        let response = self
            .request(Method::GET, self.url("status", params)?)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(response.text().await?),
            status => Err(unexpected(status, response).await),
        }
    }
}

async fn expect_reply(response: Response) -> Result<Reply, ClientError> {
    let body = response.text().await?;
    Reply::parse(&body).ok_or_else(|| ClientError::Garbled(body.trim_end().to_owned()))
}

async fn error_message(response: Response) -> String {
    let body = response.text().await.unwrap_or_default();
    match Reply::parse(&body) {
        Some(Reply::Error(message)) => message,
        _ => body.trim_end().to_owned(),
    }
}

async fn unexpected(status: StatusCode, response: Response) -> ClientError {
    let body = response.text().await.unwrap_or_default();
    debug!(status = %status, body = %body.trim_end(), "Unexpected response from remote proxy");
    ClientError::UnexpectedStatus {
        status,
        body: body.trim_end().to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(base: &str) -> ProxyApi {
        ProxyApi::new(reqwest::Client::new(), base).unwrap()
    }

    #[test]
    fn operation_urls_hang_off_the_base() {
        let api = api("http://proxy.example:8080/proxy/");
        assert_eq!(
            api.url("auth", &[]).unwrap().as_str(),
            "http://proxy.example:8080/proxy/auth"
        );
        assert_eq!(
            api.url("connect", &[("host", "db internal"), ("port", "5432")])
                .unwrap()
                .as_str(),
            "http://proxy.example:8080/proxy/connect?host=db+internal&port=5432"
        );
        assert_eq!(
            ProxyApi::new(reqwest::Client::new(), "http://proxy.example")
                .unwrap()
                .url("ping", &[("id", "x")])
                .unwrap()
                .as_str(),
            "http://proxy.example/ping?id=x"
        );
    }

    #[test]
    fn target_names_host_and_path() {
        assert_eq!(api("http://proxy.example:8080/proxy/").target(), "proxy.example:8080/proxy");
        assert_eq!(api("https://proxy.example/").target(), "proxy.example");
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(ProxyApi::new(reqwest::Client::new(), "mailto:someone@example.com").is_err());
        assert!(ProxyApi::new(reqwest::Client::new(), "ftp://example.com").is_err());
        assert!(ProxyApi::new(reqwest::Client::new(), "not a url").is_err());
    }
}
