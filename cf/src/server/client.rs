//! Command client
//!
//! Used by the CLI and by task jobs to reach a running scheduler through
//! its contact file. One request per call; connections are not pooled.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::rundir::ContactInfo;

use super::messages::{ErrorKind, Request, Response};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-side failure, classified for CLI exit codes
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The user asked for something invalid (exit 1)
    #[error("{0}")]
    User(String),
    /// The scheduler failed or cannot be reached (exit 2)
    #[error("{0}")]
    Server(String),
}

impl ClientError {
    /// CLI exit status for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Server(_) => 2,
        }
    }
}

/// A connection target resolved from a contact file
#[derive(Debug, Clone)]
pub struct Client {
    host: String,
    port: u16,
    token: String,
    timeout: Duration,
}

impl Client {
    pub fn new(host: &str, port: u16, token: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            token: token.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Resolve a client from a workflow's contact file
    pub fn from_contact_file(path: &Path) -> Result<Self, ClientError> {
        let info = ContactInfo::read(path).map_err(|e| ClientError::Server(format!("{:#}", e)))?;
        Ok(Self::new(&info.host, info.port, &info.token))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one command; returns the response `data` on success
    pub async fn request(&self, command: &str, args: Value) -> Result<Value, ClientError> {
        let req = Request {
            command: command.to_string(),
            args,
            token: self.token.clone(),
        };
        let response = tokio::time::timeout(self.timeout, self.roundtrip(&req))
            .await
            .map_err(|_| ClientError::Server(format!("timed out contacting {}:{}", self.host, self.port)))??;

        match response {
            Response::Ok { data, .. } => Ok(data),
            Response::Error { kind, message, .. } => Err(match kind {
                ErrorKind::BadRequest | ErrorKind::NotFound => ClientError::User(message),
                ErrorKind::Auth | ErrorKind::Server => ClientError::Server(message),
            }),
        }
    }

    async fn roundtrip(&self, req: &Request) -> Result<Response, ClientError> {
        let addr = (self.host.as_str(), self.port);
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ClientError::Server(format!("cannot connect to {}:{}: {}", self.host, self.port, e)))?;

        let body = serde_json::to_string(req).map_err(|e| ClientError::Server(e.to_string()))?;
        debug!(command = %req.command, "Sending request");
        stream
            .write_all(body.as_bytes())
            .await
            .map_err(|e| ClientError::Server(e.to_string()))?;
        stream.write_all(b"\n").await.map_err(|e| ClientError::Server(e.to_string()))?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| ClientError::Server(e.to_string()))?;
        serde_json::from_str(line.trim()).map_err(|e| ClientError::Server(format!("bad response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{CommandRequest, Server};
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_client_server_roundtrip() {
        let (server, port) = Server::bind("tok").await.unwrap();
        let (tx, mut rx) = mpsc::channel::<CommandRequest>(4);
        server.spawn(tx);
        tokio::spawn(async move {
            while let Some((_, reply)) = rx.recv().await {
                let _ = reply.send(Response::ok(json!("pong")));
            }
        });

        let client = Client::new("127.0.0.1", port, "tok");
        let data = client.request("ping", Value::Null).await.unwrap();
        assert_eq!(data, json!("pong"));
    }

    #[tokio::test]
    async fn test_error_kinds_map_to_exit_codes() {
        let (server, port) = Server::bind("tok").await.unwrap();
        let (tx, mut rx) = mpsc::channel::<CommandRequest>(4);
        server.spawn(tx);
        tokio::spawn(async move {
            while let Some((_, reply)) = rx.recv().await {
                let _ = reply.send(Response::error(ErrorKind::NotFound, "no such task"));
            }
        });

        let client = Client::new("127.0.0.1", port, "tok");
        let err = client.request("show", json!({"id": "ghost.1"})).await.unwrap_err();
        assert_eq!(err.exit_code(), 1);

        // Wrong token is a server-class error
        let client = Client::new("127.0.0.1", port, "bad");
        let err = client.request("ping", Value::Null).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_server_error() {
        let client = Client::new("127.0.0.1", 1, "tok").with_timeout(Duration::from_millis(500));
        let err = client.request("ping", Value::Null).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
