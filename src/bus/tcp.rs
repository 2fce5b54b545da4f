//! TCP front end for the bus
//!
//! Each client speaks newline-delimited text:
//! ```text
//! client -> bridge:  command <text>
//!                    stream <hex>
//! bridge -> client:  response <text>
//! ```

use super::{BusGateway, BusTopics};
use crate::shutdown::ShutdownSignal;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

/// Verb prefixed to every line sent to clients
pub const RESPONSE_VERB: &str = "response";

/// A parsed client line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientLine<'a> {
    Command(&'a str),
    Stream(&'a str),
}

/// Parse one line received from a client
pub fn parse_line(line: &str) -> Option<ClientLine<'_>> {
    let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
    let (verb, payload) = line.split_once(' ').unwrap_or((line, ""));
    match verb {
        "command" => Some(ClientLine::Command(payload)),
        "stream" => Some(ClientLine::Stream(payload)),
        _ => None,
    }
}

/// Accepts client connections and maps their lines onto bus channels
pub struct TcpBusGateway {
    bus: Arc<dyn BusGateway>,
    topics: BusTopics,
    listener: TcpListener,
}

impl TcpBusGateway {
    /// Bind the listening socket
    pub async fn bind(addr: &str, bus: Arc<dyn BusGateway>, topics: BusTopics) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            bus,
            topics,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until shutdown
    pub async fn serve(self, mut shutdown: ShutdownSignal) {
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            info!("[BUS] Client connected: {}", addr);
                            let client = ClientSession {
                                addr,
                                bus: self.bus.clone(),
                                topics: self.topics.clone(),
                            };
                            tokio::spawn(client.run(stream, shutdown.clone()));
                        }
                        Err(e) => {
                            error!("[BUS] Accept failed: {}", e);
                        }
                    }
                }
            }
        }
        info!("[BUS] Gateway stopped");
    }
}

/// One attached client
struct ClientSession {
    addr: SocketAddr,
    bus: Arc<dyn BusGateway>,
    topics: BusTopics,
}

impl ClientSession {
    async fn run(self, stream: TcpStream, mut shutdown: ShutdownSignal) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let mut responses = self.bus.subscribe(&self.topics.response);

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.route(&line),
                    Ok(None) => {
                        info!("[BUS] Client disconnected: {}", self.addr);
                        break;
                    }
                    Err(e) => {
                        warn!("[BUS] Read error from {}: {}", self.addr, e);
                        break;
                    }
                },
                response = responses.recv() => match response {
                    Ok(text) => {
                        let line = format!("{} {}\n", RESPONSE_VERB, text);
                        if let Err(e) = writer.write_all(line.as_bytes()).await {
                            warn!("[BUS] Write error to {}: {}", self.addr, e);
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("[BUS] Client {} lagging, skipped {} response(s)", self.addr, skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    /// Publish a client line on the matching input channel
    fn route(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let (channel, payload) = match parse_line(line) {
            Some(ClientLine::Command(text)) => (&self.topics.command, text),
            Some(ClientLine::Stream(hex)) => (&self.topics.stream, hex),
            None => {
                warn!("[BUS] Ignoring unknown line from {}: {:?}", self.addr, line);
                return;
            }
        };
        debug!("[BUS] {} -> {}", self.addr, channel);
        if let Err(e) = self.bus.publish(channel, payload.to_string()) {
            error!("[BUS] Failed to publish on {}: {}", channel, e);
        }
    }
}
