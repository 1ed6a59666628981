//! One data-plane websocket, owned by a spawned task.
//!
//! The task forwards every socket event into the session driver's queue,
//! tagged with the generation it was opened under. Closing is a message on
//! the outbound channel: once the task sees it, nothing more is forwarded.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

use super::state::Event;

#[derive(Debug)]
enum Outbound {
    Message(Message),
    Close,
}

pub(crate) struct Transport {
    generation: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

impl Transport {
    /// Spawn the socket task. With `previous` set, dialing waits until that
    /// transport's task has finished, so two sockets never overlap.
    pub(crate) fn open(
        url: String,
        generation: u64,
        events: mpsc::UnboundedSender<Event>,
        previous: Option<JoinHandle<()>>,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            run(url, generation, outbound_rx, events).await;
        });
        Self { generation, outbound, task }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn send_text(&self, text: String) {
        let _ = self.outbound.send(Outbound::Message(Message::Text(text.into())));
    }

    pub(crate) fn send_binary(&self, data: Bytes) {
        let _ = self.outbound.send(Outbound::Message(Message::Binary(data)));
    }

    /// Detach and close. A handshake still in flight is abandoned. The
    /// returned handle completes once the socket is gone.
    pub(crate) fn close(self) -> JoinHandle<()> {
        if self.outbound.send(Outbound::Close).is_err() {
            self.task.abort();
        }
        self.task
    }
}

async fn run(
    url: String,
    generation: u64,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut queued = Vec::new();
    let connect = tokio_tungstenite::connect_async(url.as_str());
    tokio::pin!(connect);
    let ws = loop {
        tokio::select! {
            biased;
            cmd = outbound.recv() => match cmd {
                Some(Outbound::Message(msg)) => queued.push(msg),
                Some(Outbound::Close) | None => {
                    tracing::trace!(generation, "data socket abandoned during handshake");
                    return;
                }
            },
            res = &mut connect => match res {
                Ok((ws, _)) => break ws,
                Err(e) => {
                    tracing::debug!(%url, generation, error = %e, "data socket connect failed");
                    let _ = events.send(Event::TransportFailed { generation, reason: e.to_string() });
                    return;
                }
            },
        }
    };
    let _ = events.send(Event::TransportOpened { generation });

    let (mut sink, mut stream) = ws.split();
    for msg in queued {
        if let Err(e) = sink.send(msg).await {
            tracing::debug!(generation, error = %e, "data socket send failed");
            let _ = events.send(Event::TransportClosed { generation, code: None, reason: e.to_string() });
            return;
        }
    }

    loop {
        tokio::select! {
            biased;
            cmd = outbound.recv() => {
                match cmd {
                    Some(Outbound::Message(msg)) => {
                        if let Err(e) = sink.send(msg).await {
                            tracing::debug!(generation, error = %e, "data socket send failed");
                            let _ = events.send(Event::TransportClosed {
                                generation,
                                code: None,
                                reason: e.to_string(),
                            });
                            return;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let frame = CloseFrame { code: CloseCode::Normal, reason: Utf8Bytes::from_static("") };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        return;
                    }
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let _ = events.send(Event::Binary { generation, data });
                    }
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(Event::Text { generation, text: text.as_str().to_string() });
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(f) => (Some(u16::from(f.code)), f.reason.as_str().to_string()),
                            None => (None, String::new()),
                        };
                        let _ = events.send(Event::TransportClosed { generation, code, reason });
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events.send(Event::TransportClosed {
                            generation,
                            code: None,
                            reason: e.to_string(),
                        });
                        return;
                    }
                    None => {
                        let _ = events.send(Event::TransportClosed {
                            generation,
                            code: None,
                            reason: String::new(),
                        });
                        return;
                    }
                }
            }
        }
    }
}
