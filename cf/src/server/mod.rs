//! Command server
//!
//! A line-JSON request/response listener bound to the loopback interface.
//! Every request is authenticated with the per-workflow bearer token from
//! the contact file before it reaches the main loop; task jobs push status
//! messages through the same channel with the same token. Protocol errors
//! are reported per-request and close the connection; the scheduler
//! continues.

pub mod client;
pub mod messages;

pub use client::{Client, ClientError};
pub use messages::{BroadcastOp, Command, ErrorKind, Request, Response, StopMode};

use eyre::{Context as _, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Maximum request line size (64 KiB)
const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// A command with its reply channel, as delivered to the main loop
pub type CommandRequest = (Command, oneshot::Sender<Response>);

/// The listening half of the command channel
pub struct Server {
    listener: TcpListener,
    token: String,
}

impl Server {
    /// Bind an ephemeral loopback port
    pub async fn bind(token: &str) -> Result<(Self, u16)> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("Failed to bind command server")?;
        let port = listener.local_addr().context("No local address")?.port();
        debug!(port, "Command server bound");
        Ok((
            Self {
                listener,
                token: token.to_string(),
            },
            port,
        ))
    }

    /// Accept connections forever, forwarding authenticated commands to the
    /// main loop
    pub fn spawn(self, tx: mpsc::Sender<CommandRequest>) {
        tokio::spawn(async move {
            loop {
                match self.listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Client connected");
                        let token = self.token.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, token, tx).await {
                                debug!(error = %e, "Connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        return;
                    }
                }
            }
        });
    }
}

async fn serve_connection(mut stream: TcpStream, token: String, tx: mpsc::Sender<CommandRequest>) -> Result<()> {
    let (read_half, mut write_half) = stream.split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await.context("read failed")?;
        if n == 0 {
            return Ok(());
        }
        if n > MAX_REQUEST_SIZE {
            send_line(&mut write_half, &Response::error(ErrorKind::BadRequest, "request too large")).await?;
            return Ok(());
        }

        let response = match serde_json::from_str::<Request>(line.trim()) {
            Err(e) => {
                // Protocol error: report and close
                send_line(&mut write_half, &Response::error(ErrorKind::BadRequest, format!("bad request: {}", e)))
                    .await?;
                return Ok(());
            }
            Ok(req) => {
                if req.token != token {
                    warn!("Rejected request with bad token");
                    send_line(&mut write_half, &Response::error(ErrorKind::Auth, "bad token")).await?;
                    return Ok(());
                }
                match Command::from_request(&req) {
                    Err(resp) => resp,
                    Ok(command) => {
                        let (reply_tx, reply_rx) = oneshot::channel();
                        if tx.send((command, reply_tx)).await.is_err() {
                            Response::error(ErrorKind::Server, "scheduler is shutting down")
                        } else {
                            reply_rx
                                .await
                                .unwrap_or_else(|_| Response::error(ErrorKind::Server, "no reply from scheduler"))
                        }
                    }
                }
            }
        };
        send_line(&mut write_half, &response).await?;
    }
}

async fn send_line<W: AsyncWriteExt + Unpin>(writer: &mut W, response: &Response) -> Result<()> {
    let body = serde_json::to_string(response).context("serialise response")?;
    writer.write_all(body.as_bytes()).await.context("write response")?;
    writer.write_all(b"\n").await.context("write newline")?;
    writer.flush().await.context("flush response")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn roundtrip(server_token: &str, request: serde_json::Value) -> Response {
        let (server, port) = Server::bind(server_token).await.unwrap();
        let (tx, mut rx) = mpsc::channel::<CommandRequest>(8);
        server.spawn(tx);

        // Echo scheduler: acknowledge every command with its debug form
        tokio::spawn(async move {
            while let Some((command, reply)) = rx.recv().await {
                let _ = reply.send(Response::ok(json!({ "applied": format!("{:?}", command) })));
            }
        });

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let body = serde_json::to_string(&request).unwrap();
        stream.write_all(body.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_authenticated_command_roundtrip() {
        let response = roundtrip(
            "secret",
            json!({"command": "ping", "args": null, "token": "secret"}),
        )
        .await;
        assert!(response.is_ok());
    }

    #[tokio::test]
    async fn test_bad_token_rejected() {
        let response = roundtrip(
            "secret",
            json!({"command": "ping", "args": null, "token": "wrong"}),
        )
        .await;
        let Response::Error { kind, .. } = response else { panic!("expected error") };
        assert_eq!(kind, ErrorKind::Auth);
    }

    #[tokio::test]
    async fn test_unknown_command_reports_bad_request() {
        let response = roundtrip(
            "secret",
            json!({"command": "frobnicate", "args": null, "token": "secret"}),
        )
        .await;
        let Response::Error { kind, .. } = response else { panic!("expected error") };
        assert_eq!(kind, ErrorKind::BadRequest);
    }
}
