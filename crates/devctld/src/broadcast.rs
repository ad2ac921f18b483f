//! Live log fan-out.
//!
//! Every service or job id owns one log channel. Output lines are published
//! without blocking; each channel is a bounded ring (`tokio::sync::broadcast`)
//! so a subscriber that falls behind loses its oldest lines and is told how
//! many were dropped instead of stalling the publisher or its peers.
//!
//! Subscribing creates the channel if it does not exist yet, so a client can
//! attach before the entry is started and still see the very first line.
//! Channels nobody listens to are pruned on the next publish; a finished
//! job's channel is closed outright since its id is never reused.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::{debug, trace};

use devctl_core::EntryId;

/// Default ring size per channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Prefix on every line the daemon itself writes into a channel.
pub const NOTICE_PREFIX: &str = "[devctl]";

/// One chunk of output (or a daemon notice) on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub channel: EntryId,
    pub text: String,
}

/// Formats a daemon notice the way it appears in a channel.
pub fn notice_text(message: &str) -> String {
    format!("{NOTICE_PREFIX} {message}\n")
}

/// Cloneable handle to the per-channel senders.
#[derive(Clone)]
pub struct LogBroadcaster {
    channels: Arc<Mutex<HashMap<EntryId, broadcast::Sender<LogLine>>>>,
    capacity: usize,
}

impl LogBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EntryId, broadcast::Sender<LogLine>>> {
        // A poisoned map is still structurally valid
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Joins a channel, creating it if needed.
    pub fn subscribe(&self, channel: &EntryId) -> LogSubscription {
        let mut channels = self.lock();
        let sender = channels
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0);

        debug!(
            channel = %channel,
            subscribers = sender.receiver_count() + 1,
            "Log subscriber attached"
        );

        LogSubscription {
            channel: channel.clone(),
            greeting: None,
            receiver: sender.subscribe(),
        }
    }

    /// Publishes a line to every current subscriber of `channel`.
    ///
    /// Never blocks. Returns the number of subscribers reached; with none the
    /// line is discarded and the channel is pruned.
    pub fn publish(&self, channel: &EntryId, text: impl Into<String>) -> usize {
        let mut channels = self.lock();
        let Some(sender) = channels.get(channel) else {
            return 0;
        };

        let line = LogLine {
            channel: channel.clone(),
            text: text.into(),
        };

        match sender.send(line) {
            Ok(reached) => reached,
            Err(_) => {
                trace!(channel = %channel, "Pruning log channel with no subscribers");
                channels.remove(channel);
                0
            }
        }
    }

    /// Publishes a daemon notice line.
    pub fn notice(&self, channel: &EntryId, message: &str) -> usize {
        self.publish(channel, notice_text(message))
    }

    /// Drops a channel. Subscribers still receive what was already
    /// published, then `recv` returns `None`.
    pub fn close(&self, channel: &EntryId) -> bool {
        let closed = self.lock().remove(channel).is_some();
        if closed {
            trace!(channel = %channel, "Log channel closed");
        }
        closed
    }

    /// Current number of subscribers on a channel.
    pub fn subscriber_count(&self, channel: &EntryId) -> usize {
        self.lock()
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of channels currently held open.
    pub fn channel_count(&self) -> usize {
        self.lock().len()
    }
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

/// A single subscriber's view of one channel.
///
/// Dropping the subscription leaves the channel.
#[derive(Debug)]
pub struct LogSubscription {
    channel: EntryId,
    greeting: Option<String>,
    receiver: broadcast::Receiver<LogLine>,
}

impl LogSubscription {
    pub fn channel(&self) -> &EntryId {
        &self.channel
    }

    /// Queues a notice delivered only to this subscriber, ahead of any
    /// published line.
    pub fn with_greeting(mut self, message: &str) -> Self {
        self.greeting = Some(notice_text(message));
        self
    }

    /// Waits for the next line.
    ///
    /// A lagging subscriber receives a notice with the number of lines it
    /// missed, then continues from the oldest line still buffered. Returns
    /// `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<LogLine> {
        if let Some(text) = self.greeting.take() {
            return Some(LogLine {
                channel: self.channel.clone(),
                text,
            });
        }

        match self.receiver.recv().await {
            Ok(line) => Some(line),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(channel = %self.channel, missed, "Log subscriber lagged");
                Some(LogLine {
                    channel: self.channel.clone(),
                    text: notice_text(&format!("{missed} lines dropped")),
                })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
