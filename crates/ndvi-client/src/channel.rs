//! NotificationChannel: the server-to-client push subscription.
//!
//! One TCP connection per session.  The client subscribes with its id and
//! then only reads: every `Alert` frame is forwarded to the session loop as
//! it arrives.  A lost connection is reported once and never retried.

use std::time::Duration;

use ndvi_proto::protocol::{AlertMessage, Frame, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::SessionEvent;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("cannot connect to push channel at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("push channel at {0} did not answer in time")]
    Timeout(String),
    #[error("push channel I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed push frame: {0}")]
    Frame(String),
}

pub struct NotificationChannel {
    stream: TcpStream,
    read_buffer: Vec<u8>,
}

impl NotificationChannel {
    /// Connect and subscribe as `client_id`.
    pub async fn connect(
        address: &str,
        client_id: &str,
        connect_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ChannelError::Connect {
                    address: address.to_string(),
                    source,
                })
            }
            Err(_) => return Err(ChannelError::Timeout(address.to_string())),
        };

        let mut channel = Self {
            stream,
            read_buffer: Vec::with_capacity(4096),
        };
        let subscribe = Frame::Subscribe {
            client_id: client_id.to_string(),
            protocol_version: PROTOCOL_VERSION,
        };
        let encoded = subscribe
            .encode()
            .map_err(|e| ChannelError::Frame(e.to_string()))?;
        channel.stream.write_all(&encoded).await?;
        info!("push channel: subscribed to {} as {}", address, client_id);
        Ok(channel)
    }

    /// Wait for the next alert.  `Ok(None)` means the server closed the
    /// connection.
    pub async fn next_alert(&mut self) -> Result<Option<AlertMessage>, ChannelError> {
        let mut tmp = [0u8; 4096];
        loop {
            while let Some((frame, consumed)) =
                Frame::decode(&self.read_buffer).map_err(|e| ChannelError::Frame(e.to_string()))?
            {
                self.read_buffer.drain(..consumed);
                match frame {
                    Frame::Alert(message) => return Ok(Some(message)),
                    other => debug!("push channel: ignoring {:?}", other),
                }
            }

            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                return Ok(None);
            }
            self.read_buffer.extend_from_slice(&tmp[..n]);
        }
    }

    /// Forward alerts into the session until the connection ends, then send
    /// a single `ChannelClosed`.
    pub fn spawn(mut self, events: mpsc::Sender<SessionEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let reason = loop {
                match self.next_alert().await {
                    Ok(Some(message)) => {
                        if events.send(SessionEvent::Push(message)).await.is_err() {
                            debug!("push channel: session gone, stopping");
                            return;
                        }
                    }
                    Ok(None) => {
                        info!("push channel: server closed the connection");
                        break None;
                    }
                    Err(e) => {
                        warn!("push channel: {}", e);
                        break Some(e.to_string());
                    }
                }
            };
            let _ = events.send(SessionEvent::ChannelClosed(reason)).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_subscribe_then_split_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let mut received = Vec::new();
            let subscribe = loop {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                if let Some((frame, _)) = Frame::decode(&received).unwrap() {
                    break frame;
                }
            };

            let alert = Frame::Alert(AlertMessage {
                id: "layer-ndvi".to_string(),
                style: "warning".to_string(),
                line1: "3 tiles remaining.".to_string(),
                line2: None,
            })
            .encode()
            .unwrap();
            // Deliver the frame in two pieces.
            socket.write_all(&alert[..3]).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            socket.write_all(&alert[3..]).await.unwrap();
            subscribe
        });

        let mut channel = NotificationChannel::connect(&address, "1700000000ABC123", Duration::from_secs(2))
            .await
            .unwrap();
        let message = channel.next_alert().await.unwrap().unwrap();
        assert_eq!(message.id, "layer-ndvi");
        assert_eq!(message.line1, "3 tiles remaining.");

        let subscribe = server.await.unwrap();
        assert_eq!(
            subscribe,
            Frame::Subscribe {
                client_id: "1700000000ABC123".to_string(),
                protocol_version: PROTOCOL_VERSION,
            }
        );
        // Server dropped its socket.
        assert!(channel.next_alert().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_garbled_length_is_a_frame_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[0xff, 0xff, 0xff, 0xff, b'{']).await.unwrap();
            // Hold the socket open so only the header can end the read.
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let mut channel = NotificationChannel::connect(&address, "id", Duration::from_secs(2))
            .await
            .unwrap();
        let err = channel.next_alert().await.err().unwrap();
        assert!(matches!(err, ChannelError::Frame(_)));
        server.abort();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = NotificationChannel::connect(&address, "id", Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ChannelError::Connect { .. }));
    }
}
