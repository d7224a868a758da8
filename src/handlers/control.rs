//! Loopback control channel
//!
//! The first connection to the control port, whatever it sends, is the
//! global shutdown trigger.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::error::HoneypotError;
use crate::events::{Event, SharedSink};

pub struct ControlChannel {
    port: u16,
    socket: TcpListener,
    sink: SharedSink,
}

impl ControlChannel {
    /// Bind the control port on 127.0.0.1 only
    pub async fn bind(port: u16, sink: SharedSink) -> Result<Self, HoneypotError> {
        let socket = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|e| HoneypotError::ControlBind { port, source: e })?;

        info!("Control channel listening on 127.0.0.1:{}", port);
        Ok(Self { port, socket, sink })
    }

    /// Wait for the single trigger connection. The socket is closed on return.
    pub async fn wait(self) -> Result<SocketAddr, HoneypotError> {
        let port = self.port;
        match self.socket.accept().await {
            Ok((stream, peer_addr)) => {
                drop(stream);
                self.sink.record(
                    Event::info("Shutdown requested via control channel")
                        .with("port", port)
                        .with("source", peer_addr.ip().to_string()),
                );
                Ok(peer_addr)
            }
            Err(e) => {
                warn!("Control channel accept error: {}", e);
                Err(HoneypotError::Accept { port, source: e })
            }
        }
    }
}

/// Ask a running honeypot to stop by connecting to its control port
pub async fn request_stop(port: u16) -> std::io::Result<()> {
    let connect = TcpStream::connect((Ipv4Addr::LOCALHOST, port));
    let stream = tokio::time::timeout(Duration::from_secs(5), connect)
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
    drop(stream);
    Ok(())
}
