// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! TCP front end shared by the Server and Relay roles.
//!
//! Each accepted connection is one session:
//!
//! ```text
//! accept ─► bulkhead slot? ─► read STREAM (handshake timeout)
//!        ─► upstream.open(source, after)
//!        ─► loop { EVENT frames } ─► optional ERROR frame ─► close
//! ```
//!
//! The downstream sends nothing after its request, so any read activity on
//! the socket (normally EOF) means it hung up; the session then drops its
//! event stream, which in turn stops the producer behind it.

use crate::config::SessionConfig;
use crate::error::{ReplicationError, Result, WireErrorKind};
use crate::metrics;
use crate::position::display_after;
use crate::protocol::{read_frame, Frame, FrameCodec, PROTOCOL_VERSION};
use crate::resilience::Bulkhead;
use crate::upstream::{Session, Upstream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

/// Accept and serve sessions for `upstream` until `shutdown` becomes true.
pub async fn serve(
    upstream: Arc<dyn Upstream>,
    listener: TcpListener,
    config: &SessionConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local_addr = listener
        .local_addr()
        .map_err(|e| ReplicationError::transport(upstream.endpoint(), e))?;
    let bulkhead = Bulkhead::new(config.max_sessions);
    let codec = FrameCodec::new(config.compression_threshold);
    let handshake_timeout = config.handshake_timeout();

    info!(
        listen_addr = %local_addr,
        upstream = %upstream.endpoint(),
        max_sessions = config.max_sessions,
        "Listening for replication sessions"
    );

    loop {
        tokio::select! {
            biased;

            _ = shutdown_signalled(&mut shutdown) => {
                info!(listen_addr = %local_addr, "Listener shutting down");
                break;
            }

            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        // Usually fd exhaustion; back off briefly
                        warn!(listen_addr = %local_addr, error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let _ = socket.set_nodelay(true);

                let permit = bulkhead.try_acquire();
                metrics::set_active_sessions(&local_addr.to_string(), bulkhead.in_use());

                let span = info_span!("wire_session", peer = %peer);
                tokio::spawn(
                    handle_connection(
                        upstream.clone(),
                        socket,
                        peer,
                        codec,
                        handshake_timeout,
                        permit,
                        shutdown.clone(),
                    )
                    .instrument(span),
                );
            }
        }
    }

    Ok(())
}

/// Resolve once the shutdown flag is set.
///
/// A dropped sender never resolves; the owner decides when to stop.
pub(crate) async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn handle_connection(
    upstream: Arc<dyn Upstream>,
    socket: TcpStream,
    peer: SocketAddr,
    codec: FrameCodec,
    handshake_timeout: Duration,
    permit: Option<OwnedSemaphorePermit>,
    mut shutdown: watch::Receiver<bool>,
) {
    let endpoint = peer.to_string();
    let (mut reader, mut writer) = socket.into_split();

    let request = match timeout(handshake_timeout, read_frame(&mut reader, &endpoint)).await {
        Err(_) => {
            warn!(
                timeout_ms = handshake_timeout.as_millis(),
                "No stream request before handshake timeout"
            );
            return;
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Bad stream request");
            return;
        }
        Ok(Ok(None)) => {
            debug!("Connection closed before stream request");
            return;
        }
        Ok(Ok(Some(Frame::Stream(request)))) => request,
        Ok(Ok(Some(_))) => {
            warn!("First frame was not a stream request");
            return;
        }
    };

    if request.version != PROTOCOL_VERSION {
        warn!(
            version = request.version,
            expected = PROTOCOL_VERSION,
            "Unsupported protocol version"
        );
        return;
    }

    let Some(_permit) = permit else {
        warn!(source_id = %request.source_id, "Session limit reached, rejecting");
        metrics::record_session("rejected", &request.source_id);
        send_error(
            &codec,
            &mut writer,
            &endpoint,
            WireErrorKind::UpstreamUnavailable,
            "session limit reached".to_string(),
        )
        .await;
        return;
    };

    let mut session = Session::new(&request.source_id);
    session.requested = request.after;

    let mut events = match upstream.open(&request.source_id, request.after).await {
        Ok(events) => events,
        Err(e) => {
            warn!(
                source_id = %request.source_id,
                after = %display_after(request.after),
                error = %e,
                "Stream request refused"
            );
            metrics::record_session("refused", &request.source_id);
            send_error(&codec, &mut writer, &endpoint, e.wire_kind(), e.to_string()).await;
            return;
        }
    };

    info!(
        source_id = %session.source_id,
        after = %display_after(session.requested),
        "Session started"
    );
    metrics::record_session("opened", &session.source_id);

    let mut byte = [0u8; 1];
    loop {
        tokio::select! {
            biased;

            _ = shutdown_signalled(&mut shutdown) => {
                debug!(source_id = %session.source_id, "Closing session for shutdown");
                break;
            }

            _ = reader.read(&mut byte) => {
                debug!(
                    source_id = %session.source_id,
                    last_sent = %display_after(session.last_sent),
                    "Downstream disconnected"
                );
                break;
            }

            item = events.next() => match item {
                Some(Ok(event)) => {
                    if let Err(e) = session.record_sent(event.position) {
                        warn!(source_id = %session.source_id, error = %e, "Out-of-order event from upstream");
                        send_error(&codec, &mut writer, &endpoint, WireErrorKind::UpstreamUnavailable, e.to_string()).await;
                        break;
                    }
                    let frame = Frame::Event { position: event.position, payload: event.payload };
                    if let Err(e) = codec.write_frame(&mut writer, &frame, &endpoint).await {
                        debug!(source_id = %session.source_id, error = %e, "Write to downstream failed");
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(source_id = %session.source_id, error = %e, "Stream failed, closing session");
                    send_error(&codec, &mut writer, &endpoint, e.wire_kind(), e.to_string()).await;
                    break;
                }
                None => {
                    send_error(
                        &codec,
                        &mut writer,
                        &endpoint,
                        WireErrorKind::UpstreamUnavailable,
                        "stream ended".to_string(),
                    )
                    .await;
                    break;
                }
            }
        }
    }

    metrics::record_session("closed", &session.source_id);
    info!(
        source_id = %session.source_id,
        last_sent = %display_after(session.last_sent),
        "Session ended"
    );
}

async fn send_error(
    codec: &FrameCodec,
    writer: &mut OwnedWriteHalf,
    endpoint: &str,
    kind: WireErrorKind,
    message: String,
) {
    let frame = Frame::Error { kind, message };
    if let Err(e) = codec.write_frame(writer, &frame, endpoint).await {
        debug!(error = %e, "Could not deliver error frame");
    }
}
