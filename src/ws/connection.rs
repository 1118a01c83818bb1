//! Per-connection socket wrapper.
//!
//! One wrapper owns one socket. A receive task decodes incoming frames and
//! pushes them onto the connection's inbound queue; a single dedicated send
//! task drains the outbound queue in enqueue order, blocking while it is
//! empty so there is never more than one writer per socket. The wrapper
//! knows nothing about match state. Any transport failure is converted into
//! a synthetic `Disconnect` frame on the inbound queue, so the match server
//! observes every connection loss uniformly.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::codec::Frame;

/// A decoded frame tagged with the connection it arrived on.
#[derive(Debug)]
pub struct MessageWrapper {
    pub source: Uuid,
    pub frame: Frame,
}

/// Outbound queue entries. `Close` flushes nothing further and ends the
/// send task.
#[derive(Debug)]
pub enum Outbound {
    Frame(Vec<u8>),
    Close(String),
}

/// Handle owned by the match server. Dropping it closes both queues, which
/// ends the I/O tasks.
pub struct ConnectionWrapper {
    id: Uuid,
    inbound_rx: mpsc::UnboundedReceiver<MessageWrapper>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
}

/// The I/O side of a connection: where the receive task pushes inbound
/// frames and the send task drains outbound ones. Split out so the tick
/// loop and codec can be driven end-to-end in tests without a socket.
pub struct ConnectionIo {
    pub id: Uuid,
    pub inbound_tx: mpsc::UnboundedSender<MessageWrapper>,
    pub outbound_rx: mpsc::UnboundedReceiver<Outbound>,
}

impl ConnectionWrapper {
    /// Create a wrapper plus its detached I/O ends.
    pub fn channels() -> (ConnectionWrapper, ConnectionIo) {
        let id = Uuid::new_v4();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            ConnectionWrapper {
                id,
                inbound_rx,
                outbound_tx,
            },
            ConnectionIo {
                id,
                inbound_tx,
                outbound_rx,
            },
        )
    }

    /// Wrap an upgraded WebSocket and spawn its receive and send tasks.
    pub fn attach(socket: WebSocket) -> ConnectionWrapper {
        let (wrapper, io) = Self::channels();
        let (sink, stream) = socket.split();
        tokio::spawn(send_loop(sink, io.outbound_rx, io.inbound_tx.clone(), io.id));
        tokio::spawn(recv_loop(stream, io.inbound_tx, io.id));
        wrapper
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Non-blocking read of the next received message, if any.
    pub fn try_dequeue(&mut self) -> Option<MessageWrapper> {
        self.inbound_rx.try_recv().ok()
    }

    /// Fire-and-forget, ordering-preserving enqueue. Errors are ignored: a
    /// closed queue means the connection is already gone and a synthetic
    /// disconnect is on its way.
    pub fn send_frame(&self, frame: &Frame) {
        let _ = self.outbound_tx.send(Outbound::Frame(frame.encode()));
    }

    /// Enqueue an already-encoded frame (movement relay path).
    pub fn send_raw(&self, bytes: Vec<u8>) {
        let _ = self.outbound_tx.send(Outbound::Frame(bytes));
    }

    /// Send a `Disconnect` frame with the given reason, then close the
    /// socket once the outbound queue has drained.
    pub fn disconnect(&self, reason: &str) {
        self.send_frame(&Frame::Disconnect {
            reason: reason.to_string(),
        });
        let _ = self.outbound_tx.send(Outbound::Close(reason.to_string()));
    }
}

async fn recv_loop(
    mut stream: SplitStream<WebSocket>,
    inbound_tx: mpsc::UnboundedSender<MessageWrapper>,
    id: Uuid,
) {
    let mut reason = String::from("Client disconnected");

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Binary(data)) => match Frame::decode(&data) {
                Ok(frame) => {
                    if inbound_tx.send(MessageWrapper { source: id, frame }).is_err() {
                        // Match server dropped the wrapper; nothing left to do.
                        return;
                    }
                }
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "Dropping undecodable frame");
                }
            },
            Ok(Message::Close(close)) => {
                if let Some(close) = close {
                    if !close.reason.is_empty() {
                        reason = close.reason.to_string();
                    }
                }
                break;
            }
            Ok(_) => {
                // Text/ping/pong frames carry no protocol data.
            }
            Err(e) => {
                debug!(connection_id = %id, error = %e, "Socket read failed");
                reason = String::from("Connection lost");
                break;
            }
        }
    }

    let _ = inbound_tx.send(MessageWrapper {
        source: id,
        frame: Frame::Disconnect { reason },
    });
}

async fn send_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    inbound_tx: mpsc::UnboundedSender<MessageWrapper>,
    id: Uuid,
) {
    while let Some(out) = outbound_rx.recv().await {
        match out {
            Outbound::Frame(bytes) => {
                if let Err(e) = sink.send(Message::Binary(bytes)).await {
                    debug!(connection_id = %id, error = %e, "Socket write failed");
                    let _ = inbound_tx.send(MessageWrapper {
                        source: id,
                        frame: Frame::Disconnect {
                            reason: String::from("Connection lost"),
                        },
                    });
                    break;
                }
            }
            Outbound::Close(reason) => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_dequeue_is_non_blocking() {
        let (mut wrapper, _io) = ConnectionWrapper::channels();
        assert!(wrapper.try_dequeue().is_none());
    }

    #[test]
    fn inbound_messages_arrive_tagged_and_in_order() {
        let (mut wrapper, io) = ConnectionWrapper::channels();
        for reason in ["one", "two"] {
            io.inbound_tx
                .send(MessageWrapper {
                    source: io.id,
                    frame: Frame::Disconnect {
                        reason: reason.into(),
                    },
                })
                .unwrap();
        }
        let first = wrapper.try_dequeue().unwrap();
        assert_eq!(first.source, wrapper.id());
        assert_eq!(
            first.frame,
            Frame::Disconnect {
                reason: "one".into()
            }
        );
        assert_eq!(
            wrapper.try_dequeue().unwrap().frame,
            Frame::Disconnect {
                reason: "two".into()
            }
        );
    }

    #[test]
    fn outbound_preserves_enqueue_order() {
        let (wrapper, mut io) = ConnectionWrapper::channels();
        wrapper.send_frame(&Frame::Discover);
        wrapper.send_frame(&Frame::Validate {
            ok: true,
            reason: String::new(),
        });

        match io.outbound_rx.try_recv().unwrap() {
            Outbound::Frame(bytes) => assert_eq!(Frame::decode(&bytes).unwrap(), Frame::Discover),
            other => panic!("unexpected outbound entry: {other:?}"),
        }
        match io.outbound_rx.try_recv().unwrap() {
            Outbound::Frame(bytes) => assert!(matches!(
                Frame::decode(&bytes).unwrap(),
                Frame::Validate { ok: true, .. }
            )),
            other => panic!("unexpected outbound entry: {other:?}"),
        }
    }

    #[test]
    fn disconnect_sends_reason_then_close() {
        let (wrapper, mut io) = ConnectionWrapper::channels();
        wrapper.disconnect("Kicked by server");

        match io.outbound_rx.try_recv().unwrap() {
            Outbound::Frame(bytes) => assert_eq!(
                Frame::decode(&bytes).unwrap(),
                Frame::Disconnect {
                    reason: "Kicked by server".into()
                }
            ),
            other => panic!("unexpected outbound entry: {other:?}"),
        }
        assert!(matches!(
            io.outbound_rx.try_recv().unwrap(),
            Outbound::Close(reason) if reason == "Kicked by server"
        ));
    }
}
