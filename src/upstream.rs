// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The upstream capability shared by Servers and Relays.
//!
//! A Client (or a Relay fetching on behalf of its own clients) never cares
//! whether it is talking to the root Server, a Relay, or a Relay of a Relay.
//! It only needs [`Upstream::open`]: connect for a source and stream every
//! event strictly after a position.
//!
//! ```text
//! Client ──► dyn Upstream ──┬── Server         (in-process)
//!                           ├── Relay          (in-process)
//!                           └── RemoteUpstream (TCP, wire protocol)
//!                                   │
//!                                   ▼
//!                         listener ──► Server | Relay
//! ```

use crate::error::{ReplicationError, Result};
use crate::event::{Event, EventSender, EventStream};
use crate::position::{display_after, CanonicalPosition};
use crate::protocol::{read_frame, Frame, FrameCodec, StreamRequest};
use crate::source::BoxFuture;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Anything that can serve `Connect` + `StreamFrom` for a source.
pub trait Upstream: Send + Sync + 'static {
    /// Human-readable endpoint, for logs and errors.
    fn endpoint(&self) -> &str;

    /// Open a stream of events of `source_id` strictly after `after`.
    ///
    /// Fails immediately with `UnknownSource` or `PositionNotAvailable` when
    /// the request cannot be served; later failures arrive as a terminal
    /// `Err` item on the stream.
    fn open<'a>(&'a self, source_id: &'a str, after: Option<CanonicalPosition>) -> BoxFuture<'a, EventStream>;
}

/// Transient per-connection state on a Server or Relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Source this session streams.
    pub source_id: String,
    /// Position the downstream asked to resume after.
    pub requested: Option<CanonicalPosition>,
    /// Last position handed to the downstream.
    pub last_sent: Option<CanonicalPosition>,
}

impl Session {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            requested: None,
            last_sent: None,
        }
    }

    /// Record an event sent downstream.
    ///
    /// Fails if the position does not extend the session's stream, which
    /// would be a gap-or-duplicate bug upstream of this session.
    pub fn record_sent(&mut self, position: CanonicalPosition) -> Result<()> {
        let floor = self.last_sent.or(self.requested);
        if let Some(floor) = floor {
            if position <= floor {
                return Err(ReplicationError::Protocol(format!(
                    "{}: position {} does not follow {}",
                    self.source_id, position, floor
                )));
            }
        }
        self.last_sent = Some(position);
        Ok(())
    }
}

/// Default connect timeout for [`RemoteUpstream`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default buffered events per remote stream.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// An upstream Server or Relay reached over TCP.
#[derive(Debug, Clone)]
pub struct RemoteUpstream {
    addr: String,
    connect_timeout: Duration,
    stream_buffer: usize,
    codec: FrameCodec,
}

impl RemoteUpstream {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stream_buffer: DEFAULT_STREAM_BUFFER,
            codec: FrameCodec::default(),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_stream_buffer(mut self, stream_buffer: usize) -> Self {
        self.stream_buffer = stream_buffer;
        self
    }

    async fn connect(&self) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => {
                // Small frames must not wait on Nagle
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(ReplicationError::transport(&self.addr, e)),
            Err(_) => Err(ReplicationError::transport(
                &self.addr,
                format!("connect timed out after {}ms", self.connect_timeout.as_millis()),
            )),
        }
    }
}

impl Upstream for RemoteUpstream {
    fn endpoint(&self) -> &str {
        &self.addr
    }

    fn open<'a>(&'a self, source_id: &'a str, after: Option<CanonicalPosition>) -> BoxFuture<'a, EventStream> {
        Box::pin(async move {
            let stream = self.connect().await?;
            let (mut read_half, mut write_half) = stream.into_split();

            let request = Frame::Stream(StreamRequest::new(source_id, after));
            self.codec.write_frame(&mut write_half, &request, &self.addr).await?;

            info!(
                source_id = %source_id,
                upstream = %self.addr,
                after = %display_after(after),
                "Opened upstream stream"
            );

            let (tx, events) = EventStream::channel(self.stream_buffer);
            let source_id = source_id.to_string();
            let endpoint = self.addr.clone();
            tokio::spawn(async move {
                // Dropping the write half would half-close the socket; keep it
                let _write_half = write_half;
                pump_remote(&mut read_half, &tx, &source_id, after, &endpoint).await;
            });

            Ok(events)
        })
    }
}

/// Forward frames from an upstream socket into the session channel.
async fn pump_remote(
    reader: &mut OwnedReadHalf,
    tx: &EventSender,
    source_id: &str,
    requested: Option<CanonicalPosition>,
    endpoint: &str,
) {
    loop {
        let frame = tokio::select! {
            _ = tx.closed() => {
                debug!(source_id = %source_id, upstream = %endpoint, "Downstream dropped remote stream");
                return;
            }
            frame = read_frame(reader, endpoint) => frame,
        };

        let item = match frame {
            Ok(Some(Frame::Event { position, payload })) => {
                Ok(Event::new(source_id, position, payload))
            }
            Ok(Some(Frame::Error { kind, message })) => {
                warn!(
                    source_id = %source_id,
                    upstream = %endpoint,
                    kind = %kind,
                    message = %message,
                    "Upstream terminated stream"
                );
                Err(ReplicationError::from_wire(kind, source_id, requested, message))
            }
            Ok(Some(Frame::Stream(_))) => Err(ReplicationError::Protocol(
                "unexpected STREAM frame from upstream".to_string(),
            )),
            Ok(None) => Err(ReplicationError::upstream_unavailable(
                source_id,
                format!("{} closed the stream", endpoint),
            )),
            Err(e) => Err(e),
        };

        let terminal = item.is_err();
        if tx.send(item).await.is_err() || terminal {
            return;
        }
    }
}
