/// Listen activation client module
///
/// Asks the single downstream listener to start a listening session. The
/// request carries no payload; the responder answers with a success flag
/// and an optional message.
///
/// Wire protocol: one JSON object per line over TCP.
///   request:  {"service": "wakeword_trigger"}
///   response: {"success": true, "message": ""}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

/// Delay between connection attempts while waiting for the service
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ActivationError {
    #[error("Activation service unavailable: {0}")]
    Unavailable(String),

    #[error("Activation request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Activation rejected: {0}")]
    Rejected(String),

    #[error("Malformed activation response: {0}")]
    Protocol(String),

    #[error("Activation I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Activation encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationResponse {
    pub success: bool,

    #[serde(default)]
    pub message: String,
}

/// Blocking request to start the downstream listener
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListenActivationClient: Send + Sync {
    /// Issue one activation request and wait for its answer
    async fn request_listen(&self) -> Result<(), ActivationError>;

    /// Wait until the responder accepts requests, up to `limit`
    async fn wait_ready(&self, limit: Duration) -> Result<(), ActivationError>;
}

/// Activation client speaking line-delimited JSON over TCP
pub struct TcpActivationClient {
    service: String,
    address: String,
}

impl TcpActivationClient {
    pub fn new(service: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            address: address.into(),
        }
    }

    async fn connect(&self) -> Result<TcpStream, ActivationError> {
        TcpStream::connect(&self.address)
            .await
            .map_err(|e| ActivationError::Unavailable(format!("{} at {}: {}", self.service, self.address, e)))
    }
}

#[async_trait]
impl ListenActivationClient for TcpActivationClient {
    async fn request_listen(&self) -> Result<(), ActivationError> {
        let stream = self.connect().await?;
        let (read_half, mut write_half) = stream.into_split();

        let mut request = serde_json::to_string(&ActivationRequest {
            service: self.service.clone(),
        })?;
        request.push('\n');
        write_half.write_all(request.as_bytes()).await?;
        write_half.flush().await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ActivationError::Protocol(
                "connection closed before response".to_string(),
            ));
        }

        let response: ActivationResponse = serde_json::from_str(line.trim())
            .map_err(|e| ActivationError::Protocol(e.to_string()))?;

        if response.success {
            debug!("{} accepted activation: {}", self.service, response.message);
            Ok(())
        } else {
            Err(ActivationError::Rejected(response.message))
        }
    }

    async fn wait_ready(&self, limit: Duration) -> Result<(), ActivationError> {
        info!("Waiting for {} at {}", self.service, self.address);

        let probe = async {
            loop {
                match TcpStream::connect(&self.address).await {
                    Ok(_) => return,
                    Err(e) => {
                        debug!("{} not ready: {}", self.service, e);
                        sleep(READY_POLL_INTERVAL).await;
                    }
                }
            }
        };

        timeout(limit, probe).await.map_err(|_| {
            ActivationError::Unavailable(format!(
                "{} did not come up within {:?}",
                self.service, limit
            ))
        })?;

        info!("Service {} is ready", self.service);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accept one connection, check the request, answer with `reply`
    async fn respond_once(listener: TcpListener, reply: &'static str) -> ActivationRequest {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();

        let mut line = String::new();
        BufReader::new(read_half).read_line(&mut line).await.unwrap();
        write_half.write_all(reply.as_bytes()).await.unwrap();

        serde_json::from_str(line.trim()).unwrap()
    }

    #[tokio::test]
    async fn test_successful_activation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(respond_once(listener, "{\"success\":true,\"message\":\"listening\"}\n"));

        let client = TcpActivationClient::new("wakeword_trigger", address);
        client.request_listen().await.unwrap();

        let request = server.await.unwrap();
        assert_eq!(request.service, "wakeword_trigger");
    }

    #[tokio::test]
    async fn test_rejected_activation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(respond_once(listener, "{\"success\":false,\"message\":\"busy\"}\n"));

        let client = TcpActivationClient::new("wakeword_trigger", address);
        match client.request_listen().await {
            Err(ActivationError::Rejected(message)) => assert_eq!(message, "busy"),
            other => panic!("Expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(respond_once(listener, "not json\n"));

        let client = TcpActivationClient::new("wakeword_trigger", address);
        assert!(matches!(
            client.request_listen().await,
            Err(ActivationError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_service() {
        // Bind then drop to get a port nobody listens on
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let client = TcpActivationClient::new("wakeword_trigger", address);
        assert!(matches!(
            client.request_listen().await,
            Err(ActivationError::Unavailable(_))
        ));
        assert!(matches!(
            client.wait_ready(Duration::from_millis(250)).await,
            Err(ActivationError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let client = TcpActivationClient::new("wakeword_trigger", address);
        client.wait_ready(Duration::from_secs(2)).await.unwrap();
        drop(listener);
    }
}
