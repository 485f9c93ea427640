//! HTTP client for the session broker API

use async_trait::async_trait;
use relayport_session::{BrokerError, RemoteTargetId, SessionBroker, SessionGrant};
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    target: &'a str,
    remote_port: u16,
}

/// Creates sessions with `POST {broker_url}/sessions`
#[derive(Debug, Clone)]
pub struct HttpSessionBroker {
    client: reqwest::Client,
    broker_url: String,
    credentials: Option<String>,
    timeout: Duration,
}

impl HttpSessionBroker {
    pub fn new(broker_url: impl Into<String>, credentials: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            broker_url: broker_url.into().trim_end_matches('/').to_string(),
            credentials,
            timeout: Duration::from_secs(10),
        }
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn sessions_url(&self) -> String {
        format!("{}/sessions", self.broker_url)
    }
}

#[async_trait]
impl SessionBroker for HttpSessionBroker {
    async fn create_session(
        &self,
        target: &RemoteTargetId,
        remote_port: u16,
    ) -> Result<SessionGrant, BrokerError> {
        let url = self.sessions_url();
        debug!("Requesting session for {}:{} from {}", target, remote_port, url);

        let mut request = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&CreateSessionRequest {
                target: &target.0,
                remote_port,
            });
        if let Some(credentials) = &self.credentials {
            request = request.bearer_auth(credentials);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let body = response.text().await.unwrap_or_default();
                return Err(BrokerError::Authorization(format!("{}: {}", status, body.trim())));
            }
            s if s.is_server_error() => {
                return Err(BrokerError::Unavailable(format!("broker returned {}", s)));
            }
            s if !s.is_success() => {
                return Err(BrokerError::InvalidResponse(format!("broker returned {}", s)));
            }
            _ => {}
        }

        let grant: SessionGrant = response
            .json()
            .await
            .map_err(|e| BrokerError::InvalidResponse(e.to_string()))?;
        info!("Broker granted session {}", grant.session_id);
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// One-shot HTTP server: captures the request, answers with `status` and `body`
    async fn fake_broker(
        status: &'static str,
        body: &'static str,
    ) -> (SocketAddr, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            let header_end = loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let headers = String::from_utf8_lossy(&request[..header_end]).to_lowercase();
            let length: usize = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .map(|v| v.trim().parse().unwrap())
                .unwrap_or(0);
            while request.len() < header_end + length {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&request).to_string());
        });

        (addr, rx)
    }

    #[tokio::test]
    async fn test_create_session_success() {
        let (addr, request) = fake_broker(
            "200 OK",
            r#"{"session_id":"s-42","token":"tok","stream_url":"wss://relay.example.com/s-42"}"#,
        )
        .await;
        let broker = HttpSessionBroker::new(format!("http://{}/", addr), Some("creds".into()));

        let grant = broker
            .create_session(&RemoteTargetId("i-0abc".into()), 8080)
            .await
            .unwrap();
        assert_eq!(grant.session_id, "s-42");
        assert_eq!(grant.stream_url, "wss://relay.example.com/s-42");

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /sessions "));
        assert!(request.to_lowercase().contains("authorization: bearer creds"));
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let body: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(body["target"], "i-0abc");
        assert_eq!(body["remote_port"], 8080);
    }

    #[tokio::test]
    async fn test_create_session_unauthorized() {
        let (addr, _request) = fake_broker("403 Forbidden", r#"{"error":"denied"}"#).await;
        let broker = HttpSessionBroker::new(format!("http://{}", addr), None);
        let err = broker
            .create_session(&RemoteTargetId("i-0abc".into()), 22)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Authorization(_)));
    }

    #[tokio::test]
    async fn test_create_session_server_error() {
        let (addr, _request) = fake_broker("503 Service Unavailable", "{}").await;
        let broker = HttpSessionBroker::new(format!("http://{}", addr), None);
        let err = broker
            .create_session(&RemoteTargetId("i-0abc".into()), 22)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_create_session_bad_body() {
        let (addr, _request) = fake_broker("200 OK", r#"{"session":"missing fields"}"#).await;
        let broker = HttpSessionBroker::new(format!("http://{}", addr), None);
        let err = broker
            .create_session(&RemoteTargetId("i-0abc".into()), 22)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_unreachable_broker() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let broker = HttpSessionBroker::new(format!("http://{}", addr), None)
            .with_timeout(Duration::from_secs(2));
        let err = broker
            .create_session(&RemoteTargetId("i-0abc".into()), 22)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
    }
}
