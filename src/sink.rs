//! Where session output ends up.
//!
//! A [`RenderSink`] receives coalesced output batches. Each batch comes with
//! a [`RenderTicket`]; completing it tells the session the bytes have been
//! consumed so flow control can lower the watermark. A sink that drops
//! tickets without completing them leaves the session paused until the
//! emergency timer releases it.

use std::io::Write;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::session::Event;

pub struct RenderTicket {
    generation: u64,
    len: usize,
    events: mpsc::UnboundedSender<Event>,
}

impl RenderTicket {
    pub(crate) fn new(generation: u64, len: usize, events: mpsc::UnboundedSender<Event>) -> Self {
        Self { generation, len, events }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Report the batch as rendered.
    pub fn complete(self) {
        let _ = self.events.send(Event::Rendered {
            generation: self.generation,
            len: self.len,
        });
    }
}

impl std::fmt::Debug for RenderTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTicket")
            .field("generation", &self.generation)
            .field("len", &self.len)
            .finish()
    }
}

pub trait RenderSink: Send + 'static {
    fn render(&mut self, data: Bytes, ticket: RenderTicket);
}

impl<F> RenderSink for F
where
    F: FnMut(Bytes, RenderTicket) + Send + 'static,
{
    fn render(&mut self, data: Bytes, ticket: RenderTicket) {
        self(data, ticket)
    }
}

/// Writes straight to the process stdout and completes immediately.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl RenderSink for StdoutSink {
    fn render(&mut self, data: Bytes, ticket: RenderTicket) {
        let mut out = std::io::stdout().lock();
        if let Err(e) = out.write_all(&data).and_then(|_| out.flush()) {
            tracing::warn!(error = %e, "failed to write session output");
        }
        ticket.complete();
    }
}

/// Hands batches to another task, which completes the tickets at its own pace.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(Bytes, RenderTicket)>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Bytes, RenderTicket)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RenderSink for ChannelSink {
    fn render(&mut self, data: Bytes, ticket: RenderTicket) {
        if self.tx.send((data, ticket)).is_err() {
            tracing::trace!("render receiver gone, dropping batch");
        }
    }
}
