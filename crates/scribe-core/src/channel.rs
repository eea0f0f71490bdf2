//! Per-job progress channel between the transcription worker and the job registry.
//!
//! Unbounded FIFO: the worker never waits on a slow poller, and nothing is reordered or
//! coalesced. Every job's channel receives exactly one [`Terminal`] message.

use tokio::sync::mpsc;

use crate::engine::Segment;

/// Messages flowing from the worker (and `request_stop`) to the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Segment(Segment),
    Control(Control),
    Terminal(Terminal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    End,
    Error { message: String, diagnostic: String },
}

/// Create a connected sender/receiver pair for one job.
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender { tx }, ProgressReceiver { rx })
}

/// Producer half. Sends never block; they return `false` once the job slot has closed.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl ProgressSender {
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Forward a segment with its text trimmed.
    pub fn segment(&self, seg: Segment) -> bool {
        self.send(Message::Segment(Segment {
            text: seg.text.trim().to_string(),
            ..seg
        }))
    }

    pub fn stop(&self) -> bool {
        self.send(Message::Control(Control::Stop))
    }

    pub fn end(&self) -> bool {
        self.send(Message::Terminal(Terminal::End))
    }

    pub fn error(&self, message: impl Into<String>, diagnostic: impl Into<String>) -> bool {
        self.send(Message::Terminal(Terminal::Error {
            message: message.into(),
            diagnostic: diagnostic.into(),
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, owned by the registry.
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl ProgressReceiver {
    /// Next buffered message, `None` when nothing is buffered right now.
    pub fn try_dequeue(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}
