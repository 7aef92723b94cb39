//! Per-link driver task.
//!
//! Waits for the handshake, then runs the link's receive loop until the
//! peer closes, a frame is malformed, the I/O fails, or the coordinator
//! cancels it. Everything it learns goes back to the coordinator as a
//! `LinkEvent`; it never touches the registry.

use std::fmt;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};

use tether_core::Frame;

use crate::framer::{FrameReader, LinkWriter};
use crate::link::{LinkHandle, LinkKey};
use crate::transport::{Connected, PathStatus, PendingLink};

/// How long a closing link may take to flush its half-close.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub enum LinkEvent {
    Ready { key: LinkKey, writer: LinkWriter },
    Frame { key: LinkKey, frame: Frame },
    Path { key: LinkKey, status: PathStatus },
    Closed { key: LinkKey, reason: CloseReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Dial or handshake did not complete.
    ConnectFailed(String),
    /// Clean EOF between frames.
    PeerClosed,
    Malformed(String),
    Io(String),
    /// A health ping could not be written.
    PingFailed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ConnectFailed(e) => write!(f, "connect failed: {e}"),
            CloseReason::PeerClosed => f.write_str("closed by peer"),
            CloseReason::Malformed(e) => write!(f, "malformed input: {e}"),
            CloseReason::Io(e) => write!(f, "i/o error: {e}"),
            CloseReason::PingFailed(e) => write!(f, "ping failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DriverSettings {
    pub max_payload: u32,
    pub write_timeout: Duration,
}

/// Spawn the driver for one link and return its handle.
pub fn spawn_link(
    key: LinkKey,
    pending: PendingLink,
    events: mpsc::Sender<LinkEvent>,
    settings: DriverSettings,
) -> LinkHandle {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let driver = tokio::spawn(drive(key, pending, cancel_rx, events, settings));
    LinkHandle::new(cancel_tx, driver)
}

enum Step {
    Cancelled,
    Frame(Option<Result<Frame, crate::framer::FrameError>>),
    Path(Option<PathStatus>),
}

async fn drive(
    key: LinkKey,
    pending: PendingLink,
    mut cancel: oneshot::Receiver<()>,
    events: mpsc::Sender<LinkEvent>,
    settings: DriverSettings,
) {
    let connected = tokio::select! {
        _ = &mut cancel => {
            tracing::debug!(endpoint = %key.endpoint, link = %key.id, "cancelled while connecting");
            return;
        }
        result = pending => result,
    };

    let Connected {
        reader,
        writer,
        mut status,
    } = match connected {
        Ok(c) => c,
        Err(e) => {
            let reason = CloseReason::ConnectFailed(e.to_string());
            emit(&mut cancel, &events, LinkEvent::Closed { key, reason }).await;
            return;
        }
    };

    let writer = LinkWriter::new(writer, settings.max_payload, settings.write_timeout);
    let ready = LinkEvent::Ready {
        key: key.clone(),
        writer: writer.clone(),
    };
    if !emit(&mut cancel, &events, ready).await {
        writer.shutdown(SHUTDOWN_GRACE).await;
        return;
    }

    let waiting_now = status
        .as_ref()
        .map_or(false, |rx| *rx.borrow() == PathStatus::Waiting);
    if waiting_now {
        let path = LinkEvent::Path {
            key: key.clone(),
            status: PathStatus::Waiting,
        };
        if !emit(&mut cancel, &events, path).await {
            writer.shutdown(SHUTDOWN_GRACE).await;
            return;
        }
    }

    let frames = FrameReader::new(reader, settings.max_payload).into_stream();
    tokio::pin!(frames);

    let reason = loop {
        let step = tokio::select! {
            _ = &mut cancel => Step::Cancelled,
            next = frames.next() => Step::Frame(next),
            changed = path_changed(&mut status) => Step::Path(changed),
        };

        let event = match step {
            Step::Cancelled => break None,
            Step::Frame(Some(Ok(frame))) => {
                tracing::trace!(
                    endpoint = %key.endpoint,
                    message_type = frame.message_type,
                    bytes = frame.payload.len(),
                    "frame received"
                );
                LinkEvent::Frame {
                    key: key.clone(),
                    frame,
                }
            }
            Step::Frame(Some(Err(e))) if e.is_malformed() => {
                break Some(CloseReason::Malformed(e.to_string()))
            }
            Step::Frame(Some(Err(e))) => break Some(CloseReason::Io(e.to_string())),
            Step::Frame(None) => break Some(CloseReason::PeerClosed),
            Step::Path(Some(s)) => LinkEvent::Path {
                key: key.clone(),
                status: s,
            },
            Step::Path(None) => {
                // Transport dropped its status channel; nothing more to watch.
                status = None;
                continue;
            }
        };
        if !emit(&mut cancel, &events, event).await {
            break None;
        }
    };

    writer.shutdown(SHUTDOWN_GRACE).await;
    if let Some(reason) = reason {
        emit(&mut cancel, &events, LinkEvent::Closed { key, reason }).await;
    }
}

/// Deliver an event unless the link is cancelled first. Returns false when
/// the driver should stop.
async fn emit(
    cancel: &mut oneshot::Receiver<()>,
    events: &mpsc::Sender<LinkEvent>,
    event: LinkEvent,
) -> bool {
    tokio::select! {
        _ = cancel => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

/// Next path-status change. `None` once the transport stops reporting.
async fn path_changed(status: &mut Option<watch::Receiver<PathStatus>>) -> Option<PathStatus> {
    match status {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}
