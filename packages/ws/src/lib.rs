//! `WebSocket` transport for the `GameBox` line protocols.
//!
//! This crate provides the duplex text-line channel the rest of the client is
//! built on: outbound lines go in one side, inbound lines and a final close
//! notification come out the other. Each [`Transport`] covers exactly one
//! connection attempt; connection loss is surfaced as a
//! [`TransportEvent::Closed`] event rather than hidden behind a retry loop,
//! since the registration protocol treats every disconnection as the end of
//! the session.
//!
//! # Features
//!
//! * Line-oriented send/receive over a `tokio-tungstenite` `WebSocket`
//! * Graceful cancellation through a shared [`CancellationToken`]
//! * Keepalive pings while the connection is open
//! * An in-memory [`Transport::pair`] double for driving tests without a
//!   network
//!
//! # Examples
//!
//! ```rust,no_run
//! # use gamebox_ws::{Transport, TransportEvent};
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Transport::connect("ws://localhost:35555/").await?;
//! let (handle, mut events) = transport.split();
//!
//! handle.send("LOGIN 1 alice")?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         TransportEvent::Line(line) => println!("Received: {line}"),
//!         TransportEvent::Closed(reason) => {
//!             println!("Closed: {reason:?}");
//!             break;
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures_util::{StreamExt as _, pin_mut};
use thiserror::Error;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const PING_INTERVAL: Duration = Duration::from_millis(5000);

/// Error type for websocket connection failures.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The `WebSocket` handshake failed.
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// The endpoint could not be reached at all.
    #[error("Connection refused: {0}")]
    Refused(String),
}

/// Error type for sending lines over a transport.
#[derive(Debug, Error)]
pub enum TransportSendError {
    /// The transport has already closed; the line was not sent.
    #[error("Transport is closed")]
    Closed,
}

/// Why a transport stopped delivering events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection normally.
    Graceful,
    /// The local side cancelled the connection.
    Cancelled,
    /// The connection failed with a transport-level error.
    Error(String),
}

/// Inbound side of the duplex channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text line from the server.
    Line(String),
    /// The connection ended. Always the final event of a transport.
    Closed(CloseReason),
}

enum OutboundMessage {
    Line(String),
    Ping,
}

/// Trait for types that can send protocol lines.
#[async_trait]
pub trait LineSender: Send + Sync {
    /// Sends a text line.
    ///
    /// # Errors
    ///
    /// * Returns [`TransportSendError::Closed`] if the transport has closed
    async fn send_line(&self, line: &str) -> Result<(), TransportSendError>;
}

impl core::fmt::Debug for dyn LineSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{LineSender}}")
    }
}

/// A handle to a transport that allows sending lines and closing the
/// connection from anywhere.
#[derive(Clone)]
pub struct TransportHandle {
    sender: Arc<RwLock<Option<UnboundedSender<OutboundMessage>>>>,
    token: CancellationToken,
}

impl TransportHandle {
    /// Sends a text line over the transport.
    ///
    /// # Errors
    ///
    /// * Returns [`TransportSendError::Closed`] if the transport has closed
    ///
    /// # Panics
    ///
    /// * Panics if the internal `RwLock` is poisoned
    pub fn send(&self, line: &str) -> Result<(), TransportSendError> {
        self.sender
            .read()
            .unwrap()
            .as_ref()
            .ok_or(TransportSendError::Closed)?
            .unbounded_send(OutboundMessage::Line(line.to_string()))
            .map_err(|_| TransportSendError::Closed)
    }

    /// Initiates connection shutdown.
    ///
    /// The close completes asynchronously; the owner of the event stream
    /// receives a final [`TransportEvent::Closed`] once the connection has
    /// actually gone down.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been initiated or completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[async_trait]
impl LineSender for TransportHandle {
    async fn send_line(&self, line: &str) -> Result<(), TransportSendError> {
        self.send(line)
    }
}

/// One connection attempt's duplex channel: a [`TransportHandle`] for the
/// outbound side and a stream of [`TransportEvent`]s for the inbound side.
pub struct Transport {
    handle: TransportHandle,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Transport {
    /// Opens a `WebSocket` connection to `url` and wraps it as a line
    /// transport.
    ///
    /// # Errors
    ///
    /// * Returns [`ConnectError::WebSocket`] if the handshake fails
    pub async fn connect(url: &str) -> Result<Self, ConnectError> {
        log::debug!("Connecting to websocket '{url}'...");
        let (ws_stream, _) = connect_async(url).await?;
        log::debug!("WebSocket handshake has been successfully completed");

        let (outbound_tx, outbound_rx) = futures_channel::mpsc::unbounded();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let sender = Arc::new(RwLock::new(Some(outbound_tx)));

        tokio::spawn(pump(
            ws_stream,
            outbound_rx,
            sender.clone(),
            events_tx,
            token.clone(),
        ));

        Ok(Self {
            handle: TransportHandle { sender, token },
            events: events_rx,
        })
    }

    /// Creates an in-memory transport plus the [`TransportDriver`] that
    /// plays the server's role. Used by tests across the workspace.
    #[must_use]
    pub fn pair() -> (Self, TransportDriver) {
        let (outbound_tx, outbound_rx) = futures_channel::mpsc::unbounded();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let sender = Arc::new(RwLock::new(Some(outbound_tx)));

        // Mirror a real socket teardown: cancellation eventually comes back
        // around as a confirmed close on the event stream.
        tokio::spawn({
            let token = token.clone();
            let sender = sender.clone();
            let events_tx = events_tx.clone();
            async move {
                token.cancelled().await;
                sender.write().unwrap().take();
                let _ = events_tx.send(TransportEvent::Closed(CloseReason::Cancelled));
            }
        });

        (
            Self {
                handle: TransportHandle {
                    sender,
                    token: token.clone(),
                },
                events: events_rx,
            },
            TransportDriver {
                outbound: outbound_rx,
                events: events_tx,
                token,
            },
        )
    }

    /// A cloneable handle to the outbound side.
    #[must_use]
    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    /// Splits the transport into its outbound handle and inbound event
    /// stream.
    #[must_use]
    pub fn split(self) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>) {
        (self.handle, self.events)
    }
}

/// The server end of a [`Transport::pair`]: pushes inbound lines, observes
/// outbound lines, and forces closure.
pub struct TransportDriver {
    outbound: UnboundedReceiver<OutboundMessage>,
    events: mpsc::UnboundedSender<TransportEvent>,
    token: CancellationToken,
}

impl TransportDriver {
    /// Delivers a line to the client side.
    pub fn push_line(&self, line: &str) {
        let _ = self.events.send(TransportEvent::Line(line.to_string()));
    }

    /// Ends the connection from the server side.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.events.send(TransportEvent::Closed(reason));
    }

    /// Receives the next line the client sent, skipping keepalives.
    /// Returns `None` once the client side has shut down.
    pub async fn recv_line(&mut self) -> Option<String> {
        loop {
            match self.outbound.next().await? {
                OutboundMessage::Line(line) => return Some(line),
                OutboundMessage::Ping => {}
            }
        }
    }

    /// Whether the client initiated shutdown.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[allow(clippy::cognitive_complexity)]
async fn pump(
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    outbound_rx: UnboundedReceiver<OutboundMessage>,
    sender: Arc<RwLock<Option<UnboundedSender<OutboundMessage>>>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    token: CancellationToken,
) {
    let (write, mut read) = ws_stream.split();
    let pinger_tx = { sender.read().unwrap().clone() };

    let ws_writer = outbound_rx
        .map(|message| {
            Ok(match message {
                OutboundMessage::Line(line) => {
                    log::trace!("Sending line: {line}");
                    Message::Text(line.into())
                }
                OutboundMessage::Ping => {
                    log::trace!("Sending ping");
                    Message::Ping(vec![].into())
                }
            })
        })
        .forward(write);
    pin_mut!(ws_writer);

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    #[allow(clippy::redundant_pub_crate)]
    let reason = loop {
        select!(
            () = token.cancelled() => {
                log::debug!("Cancelling connection");
                break CloseReason::Cancelled;
            }
            result = &mut ws_writer => {
                break match result {
                    Ok(()) => CloseReason::Graceful,
                    Err(e) => CloseReason::Error(e.to_string()),
                };
            }
            _ = ping_interval.tick() => {
                let sent = pinger_tx
                    .as_ref()
                    .is_some_and(|tx| tx.unbounded_send(OutboundMessage::Ping).is_ok());
                if !sent {
                    break CloseReason::Cancelled;
                }
            }
            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        log::trace!("Line from server: {text}");
                        if events_tx.send(TransportEvent::Line(text.to_string())).is_err() {
                            break CloseReason::Cancelled;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::debug!("Received close frame: {frame:?}");
                        break CloseReason::Graceful;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Binary(_))) => {
                        log::warn!("Ignoring binary frame on line transport");
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket read error: {e:?}");
                        break CloseReason::Error(e.to_string());
                    }
                    None => break CloseReason::Graceful,
                }
            }
        );
    };

    sender.write().unwrap().take();
    token.cancel();
    let _ = events_tx.send(TransportEvent::Closed(reason));
    log::info!("WebSocket connection closed");
}
