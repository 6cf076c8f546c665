//! HTTP layer of the registration handshake.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode, header::SET_COOKIE};

use crate::registration::error::{RegistrationError, RegistrationResult};

/// A received HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    /// Status code.
    pub status: u16,
    /// Raw `Set-Cookie` header values.
    pub set_cookies: Vec<String>,
    /// Response body.
    pub body: Bytes,
}

impl HttpReply {
    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body parsed as JSON, `None` if it is not JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// Reason for a failed response: the body's `message` or `error` field,
    /// or the status text.
    pub fn failure_message(&self) -> String {
        let from_body = self.json().and_then(|doc| {
            ["message", "error"]
                .iter()
                .find_map(|key| doc.get(key).and_then(|v| v.as_str()).map(str::to_string))
        });
        from_body.unwrap_or_else(|| {
            let reason = StatusCode::from_u16(self.status)
                .ok()
                .and_then(|s| s.canonical_reason());
            match reason {
                Some(reason) => format!("server responded with {} {reason}", self.status),
                None => format!("server responded with status {}", self.status),
            }
        })
    }

    /// `Cookie` header value echoing every received cookie.
    pub fn cookie_header(&self) -> String {
        self.set_cookies
            .iter()
            .filter_map(|c| c.split(';').next())
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Sends the registration requests.
#[async_trait]
pub trait RegistrationTransport: Send + Sync {
    /// `GET url`.
    async fn get(&self, url: &str) -> RegistrationResult<HttpReply>;

    /// `POST url` with a JSON body.
    async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &serde_json::Value,
    ) -> RegistrationResult<HttpReply>;
}

/// [`RegistrationTransport`] backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Transport with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport reusing `client`.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn into_reply(url: &str, response: reqwest::Response) -> RegistrationResult<HttpReply> {
        let status = response.status().as_u16();
        let set_cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        let body = response.bytes().await.map_err(|e| network(url, &e))?;
        Ok(HttpReply {
            status,
            set_cookies,
            body,
        })
    }
}

fn network(url: &str, e: &reqwest::Error) -> RegistrationError {
    RegistrationError::Network {
        url: url.to_string(),
        message: e.to_string(),
    }
}

#[async_trait]
impl RegistrationTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> RegistrationResult<HttpReply> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| network(url, &e))?;
        Self::into_reply(url, response).await
    }

    async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &serde_json::Value,
    ) -> RegistrationResult<HttpReply> {
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        let response = request.send().await.map_err(|e| network(url, &e))?;
        Self::into_reply(url, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(status: u16, body: &'static str) -> HttpReply {
        HttpReply {
            status,
            set_cookies: Vec::new(),
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    #[test]
    fn failure_message_prefers_body() {
        assert_eq!(reply(400, r#"{"message": "bad path"}"#).failure_message(), "bad path");
        assert_eq!(reply(400, r#"{"error": "nope"}"#).failure_message(), "nope");
        assert_eq!(
            reply(403, "<html>").failure_message(),
            "server responded with 403 Forbidden"
        );
    }

    #[test]
    fn cookie_header_keeps_name_value_pairs() {
        let reply = HttpReply {
            status: 200,
            set_cookies: vec![
                "csrftoken=abc; expires=Thu, 01 Jan 2026 00:00:00 GMT; Path=/".to_string(),
                "sessionid=xyz; HttpOnly".to_string(),
            ],
            body: Bytes::new(),
        };
        assert_eq!(reply.cookie_header(), "csrftoken=abc; sessionid=xyz");
    }
}
