//! Queuing event sink.
//!
//! A player starts emitting as soon as it is created, usually before the
//! host has subscribed to its event channel. Messages are held until a
//! delegate attaches, then delivered in order. After end-of-stream the
//! sink accepts nothing more.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::event::{PlayerEvent, SinkMessage};

/// Where a listening host receives a player's messages.
pub trait EventDelegate: Send + Sync {
    fn deliver(&self, message: SinkMessage);
}

#[derive(Default)]
pub struct QueuingEventSink {
    inner: Mutex<SinkInner>,
}

#[derive(Default)]
struct SinkInner {
    delegate: Option<Arc<dyn EventDelegate>>,
    queue: Vec<SinkMessage>,
    done: bool,
}

impl QueuingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach (or with `None`, detach) the delegate, flushing anything queued.
    pub fn set_delegate(&self, delegate: Option<Arc<dyn EventDelegate>>) {
        let mut inner = self.inner.lock();
        inner.delegate = delegate;
        Self::flush(&mut inner);
    }

    pub fn success(&self, event: PlayerEvent) {
        self.enqueue(SinkMessage::Success { event });
    }

    pub fn error(&self, code: &str, message: &str, details: Option<String>) {
        self.enqueue(SinkMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
            details,
        });
    }

    pub fn end_of_stream(&self) {
        let mut inner = self.inner.lock();
        if inner.done {
            return;
        }
        inner.queue.push(SinkMessage::EndOfStream);
        inner.done = true;
        Self::flush(&mut inner);
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().done
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    fn enqueue(&self, message: SinkMessage) {
        let mut inner = self.inner.lock();
        if inner.done {
            return;
        }
        inner.queue.push(message);
        Self::flush(&mut inner);
    }

    // Delivery happens under the lock so concurrent emitters stay ordered.
    fn flush(inner: &mut SinkInner) {
        let Some(delegate) = inner.delegate.clone() else {
            return;
        };
        for message in inner.queue.drain(..) {
            delegate.deliver(message);
        }
    }
}

/// Forwards messages into an mpsc channel.
pub struct ChannelDelegate {
    tx: Mutex<Sender<SinkMessage>>,
}

impl ChannelDelegate {
    pub fn new() -> (Self, Receiver<SinkMessage>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Mutex::new(tx) }, rx)
    }
}

impl EventDelegate for ChannelDelegate {
    fn deliver(&self, message: SinkMessage) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.lock().send(message);
    }
}

/// Holds messages until polled. Used by hosts that pull (FFI).
#[derive(Default)]
pub struct BufferDelegate {
    buffer: Mutex<VecDeque<SinkMessage>>,
}

impl BufferDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<SinkMessage> {
        self.buffer.lock().drain(..).collect()
    }
}

impl EventDelegate for BufferDelegate {
    fn deliver(&self, message: SinkMessage) {
        self.buffer.lock().push_back(message);
    }
}
