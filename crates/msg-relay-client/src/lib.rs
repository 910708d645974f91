//! Message Relay Client
//!
//! HTTP implementation of [`Relay`] for the store-and-forward message relay.
//! Every trait method maps to a single request; the polling waits come from
//! the trait's provided methods.

use mpc_session::mpc::{async_trait, Relay};
use mpc_session::{Error, Result, ServiceConfig};
use msg_relay::ProtocolMessage;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, instrument};

/// Header carrying the relay tag (setup key type or keysign message id)
const MESSAGE_ID_HEADER: &str = "message_id";

/// HTTP-based relay client
#[derive(Clone)]
pub struct RelayClient {
    /// HTTP client
    client: Client,
    /// Relay service URL
    url: String,
    /// Request timeout
    timeout: Duration,
}

impl RelayClient {
    /// Create a new relay client
    pub fn new(url: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(&config.relay_url).with_timeout(config.request_timeout())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Relay(e.to_string()))
    }

    async fn expect_status(&self, request: RequestBuilder, expected: StatusCode, what: &str) -> Result<Response> {
        let response = self.send(request).await?;
        if response.status() != expected {
            return Err(Error::Relay(format!(
                "{} failed with status: {}",
                what,
                response.status()
            )));
        }
        Ok(response)
    }

    async fn expect_success(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(Error::Relay(format!(
                "{} failed with status: {}",
                what,
                response.status()
            )));
        }
        Ok(response)
    }

    /// Decode a JSON body, treating an empty body as the default value
    async fn json_or_default<T: DeserializeOwned + Default>(response: Response) -> Result<T> {
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;
        if body.is_empty() {
            return Ok(T::default());
        }
        serde_json::from_slice(&body).map_err(|e| Error::Deserialization(e.to_string()))
    }

    async fn party_list(&self, path: String, what: &str) -> Result<Vec<String>> {
        let response = self.send(self.client.get(self.endpoint(&path))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Error::Relay(format!(
                "{} failed with status: {}",
                what,
                response.status()
            )));
        }
        Self::json_or_default(response).await
    }
}

#[async_trait]
impl Relay for RelayClient {
    #[instrument(skip(self))]
    async fn register_session(&self, session_id: &str, party_id: &str) -> Result<()> {
        let request = self.client.post(self.endpoint(session_id)).json(&[party_id]);
        self.expect_status(request, StatusCode::CREATED, "register session").await?;
        debug!("Registered with relay");
        Ok(())
    }

    async fn session_parties(&self, session_id: &str) -> Result<Vec<String>> {
        self.party_list(session_id.to_string(), "get session parties").await
    }

    #[instrument(skip(self))]
    async fn start_session(&self, session_id: &str, parties: &[String]) -> Result<()> {
        let request = self
            .client
            .post(self.endpoint(&format!("start/{}", session_id)))
            .json(parties);
        self.expect_success(request, "start session").await?;
        debug!("Session started");
        Ok(())
    }

    async fn started_parties(&self, session_id: &str) -> Result<Vec<String>> {
        self.party_list(format!("start/{}", session_id), "get started parties")
            .await
    }

    #[instrument(skip(self, payload))]
    async fn upload_setup_message(&self, session_id: &str, tag: &str, payload: &str) -> Result<()> {
        let request = self
            .client
            .post(self.endpoint(&format!("setup-message/{}", session_id)))
            .header(MESSAGE_ID_HEADER, tag)
            .body(payload.to_string());
        self.expect_status(request, StatusCode::CREATED, "upload setup message")
            .await?;
        debug!(bytes = payload.len(), "Setup message uploaded");
        Ok(())
    }

    async fn get_setup_message(&self, session_id: &str, tag: &str) -> Result<Option<String>> {
        let request = self
            .client
            .get(self.endpoint(&format!("setup-message/{}", session_id)))
            .header(MESSAGE_ID_HEADER, tag);
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::Relay(format!(
                "get setup message failed with status: {}",
                response.status()
            )));
        }
        let payload = response
            .text()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;
        Ok((!payload.is_empty()).then_some(payload))
    }

    #[instrument(skip(self, message), fields(session_id = %message.session_id, to = ?message.to, seq = message.sequence_no))]
    async fn send_message(&self, message: &ProtocolMessage, tag: &str) -> Result<()> {
        let request = self
            .client
            .post(self.endpoint(&format!("message/{}", message.session_id)))
            .header(MESSAGE_ID_HEADER, tag)
            .json(message);
        self.expect_status(request, StatusCode::ACCEPTED, "send message").await?;
        debug!("Message posted");
        Ok(())
    }

    async fn download_messages(
        &self,
        session_id: &str,
        party_id: &str,
        tag: &str,
    ) -> Result<Vec<ProtocolMessage>> {
        let request = self
            .client
            .get(self.endpoint(&format!("message/{}/{}", session_id, party_id)))
            .header(MESSAGE_ID_HEADER, tag);
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Error::Relay(format!(
                "download messages failed with status: {}",
                response.status()
            )));
        }
        let mut messages: Vec<ProtocolMessage> = Self::json_or_default(response).await?;
        messages.sort_by_key(|m| m.sequence_no);
        Ok(messages)
    }

    async fn delete_message(&self, session_id: &str, party_id: &str, hash: &str, tag: &str) -> Result<()> {
        let request = self
            .client
            .delete(self.endpoint(&format!("message/{}/{}/{}", session_id, party_id, hash)))
            .header(MESSAGE_ID_HEADER, tag);
        self.expect_success(request, "delete message").await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn complete_session(&self, session_id: &str, party_id: &str) -> Result<()> {
        let request = self
            .client
            .post(self.endpoint(&format!("complete/{}", session_id)))
            .json(&[party_id]);
        self.expect_success(request, "complete session").await?;
        debug!("Session marked complete");
        Ok(())
    }

    async fn completed_parties(&self, session_id: &str) -> Result<Vec<String>> {
        self.party_list(format!("complete/{}", session_id), "get completed parties")
            .await
    }

    #[instrument(skip(self))]
    async fn end_session(&self, session_id: &str) -> Result<()> {
        self.expect_success(self.client.delete(self.endpoint(session_id)), "end session")
            .await?;
        debug!("Session ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_trimmed() {
        let client = RelayClient::new("http://relay:8080/");
        assert_eq!(client.url(), "http://relay:8080");
        assert_eq!(client.endpoint("start/s1"), "http://relay:8080/start/s1");
    }

    #[test]
    fn test_from_config() {
        let config: ServiceConfig = serde_json::from_str(
            r#"{"relay_url":"http://relay:9090//","vaults_dir":"/tmp/v","request_timeout_secs":5}"#,
        )
        .unwrap();
        let client = RelayClient::from_config(&config);
        assert_eq!(client.url(), "http://relay:9090");
        assert_eq!(client.timeout, Duration::from_secs(5));
    }
}
