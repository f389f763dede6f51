//! Thin wrapper around [reqwest] used for every outbound call.
//!
//! Keeps transport-level error classification (timeout vs. connection vs.
//! protocol) in one place so callers can decide what is worth retrying.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;

pub type Method = reqwest::Method;
pub type StatusCode = reqwest::StatusCode;
pub type Headers = HashMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to build client: {0}")]
    Config(String),

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(reqwest::Error),

    #[error("request failed: {0}")]
    Request(reqwest::Error),

    #[error("server replied with status: {0}")]
    Status(StatusCode),

    #[error("failed to deserialize response: {0}")]
    Decode(reqwest::Error),
}

impl ClientError {
    /// Transport-level timeout, the only condition the session quick-retries.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout)
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else if err.is_connect() {
            ClientError::Connect(err)
        } else if err.is_decode() {
            ClientError::Decode(err)
        } else {
            ClientError::Request(err)
        }
    }
}

#[derive(Debug)]
pub struct Response(reqwest::Response);

impl Response {
    pub fn status(&self) -> StatusCode {
        self.0.status()
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T, ClientError> {
        self.0.json().await.map_err(ClientError::from)
    }

    pub async fn text(self) -> Result<String, ClientError> {
        self.0.text().await.map_err(ClientError::from)
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    client: reqwest::Client,
    timeout: Option<Duration>,
}

impl Client {
    pub fn new(timeout: Option<Duration>) -> Result<Self, ClientError> {
        Self::builder(timeout, false)
    }

    /// Client for the UPS appliance itself, which serves a self-signed
    /// certificate on its management interface.
    pub fn insecure(timeout: Option<Duration>) -> Result<Self, ClientError> {
        Self::builder(timeout, true)
    }

    fn builder(timeout: Option<Duration>, accept_invalid_certs: bool) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    /// Perform a request against `url`, with the `decorator` closure filling
    /// in headers, query parameters and body.
    pub async fn request<D>(
        &self,
        method: Method,
        url: &str,
        decorator: D,
    ) -> Result<Response, ClientError>
    where
        D: FnOnce(RequestBuilder) -> RequestBuilder,
    {
        let mut request = self.client.request(method, url);

        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        request = decorator(request);

        Ok(Response(request.send().await?))
    }

    /// GET expecting a JSON body; non-2xx statuses become [ClientError::Status].
    pub async fn get_json<T>(
        &self,
        url: &str,
        headers: &Headers,
        query: &[(&str, &str)],
    ) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
    {
        wrap_status_error(
            self.request(Method::GET, url, |req| {
                with_headers(req, headers).query(query)
            })
            .await?,
        )?
        .json()
        .await
    }

    /// POST with no request body, expecting a JSON response.
    pub async fn post_json<T>(
        &self,
        url: &str,
        headers: &Headers,
        query: &[(&str, &str)],
    ) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
    {
        wrap_status_error(
            self.request(Method::POST, url, |req| {
                with_headers(req, headers).query(query)
            })
            .await?,
        )?
        .json()
        .await
    }
}

fn with_headers(mut request: RequestBuilder, headers: &Headers) -> RequestBuilder {
    for (name, value) in headers {
        request = request.header(name, value);
    }
    request
}

fn wrap_status_error(res: Response) -> Result<Response, ClientError> {
    match res.status() {
        status if status.is_success() => Ok(res),
        status => Err(ClientError::Status(status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use serde_json::Value;

    #[tokio::test]
    async fn get_json_returns_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/status")
            .match_header("token", "abc")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok": true}"#)
            .create_async()
            .await;

        let client = Client::new(None).unwrap();
        let headers = Headers::from([("token".to_string(), "abc".to_string())]);
        let value: Value = client
            .get_json(&format!("{}/status", server.url()), &headers, &[])
            .await
            .unwrap();

        assert_eq!(value, serde_json::json!({"ok": true}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .create_async()
            .await;

        let client = Client::new(None).unwrap();
        let res: Result<Value, _> = client
            .get_json(&format!("{}/missing", server.url()), &Headers::new(), &[])
            .await;

        assert!(matches!(
            res,
            Err(ClientError::Status(StatusCode::NOT_FOUND))
        ));
        mock.assert_async().await;
    }
}
