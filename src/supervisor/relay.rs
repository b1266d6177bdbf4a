use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::events::{BackendEvent, OutputStream};
use super::BACKEND_TARGET;
use crate::local_logger::suspend_progress_bar;
use crate::prelude::*;

/// The only capability the supervisor needs from the presentation layer.
pub trait Broadcast: Send + Sync {
    fn broadcast(&self, event: BackendEvent);
}

/// A subscriber to supervisor events, typically one UI window.
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    /// A closed sink is skipped and dropped from the subscriber list.
    fn is_closed(&self) -> bool {
        false
    }

    fn send(&self, event: &BackendEvent) -> Result<()>;
}

/// Fans supervisor events out to every open subscriber.
///
/// Delivery is fire-and-forget: no replay for sinks subscribed after an event was sent, and a
/// sink failing to accept an event never prevents delivery to the others.
#[derive(Default)]
pub struct OutputRelay {
    sinks: Mutex<Vec<Arc<dyn EventSink>>>,
}

impl OutputRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        debug!("Subscribing event sink '{}'", sink.name());
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    pub fn subscriber_count(&self) -> usize {
        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        sinks.retain(|sink| !sink.is_closed());
        sinks.len()
    }
}

impl Broadcast for OutputRelay {
    fn broadcast(&self, event: BackendEvent) {
        // Send outside the lock so a sink may subscribe others from its callback
        let sinks = {
            let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
            sinks.retain(|sink| !sink.is_closed());
            sinks.clone()
        };

        for sink in sinks {
            // The sink may have closed since the snapshot was taken
            if sink.is_closed() {
                continue;
            }
            if let Err(error) = sink.send(&event) {
                warn!(
                    "Failed to deliver '{}' to sink '{}': {error:#}",
                    event.channel(),
                    sink.name()
                );
            }
        }
    }
}

/// Sink backed by an unbounded channel, closed once its receiver is dropped.
pub struct ChannelSink {
    name: String,
    sender: UnboundedSender<BackendEvent>,
}

impl ChannelSink {
    pub fn new(name: impl Into<String>) -> (Self, UnboundedReceiver<BackendEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                name: name.into(),
                sender,
            },
            receiver,
        )
    }
}

impl EventSink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn send(&self, event: &BackendEvent) -> Result<()> {
        self.sender
            .send(event.clone())
            .map_err(|_| anyhow!("receiver dropped"))
    }
}

/// Writes every event as one JSON line on stdout.
pub struct JsonLinesSink;

impl EventSink for JsonLinesSink {
    fn name(&self) -> &str {
        "json-lines"
    }

    fn send(&self, event: &BackendEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        suspend_progress_bar(|| println!("{line}"));
        Ok(())
    }
}

/// Routes events to the log facade.
pub struct LogSink;

impl EventSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn send(&self, event: &BackendEvent) -> Result<()> {
        match event {
            BackendEvent::Output {
                stream: OutputStream::Stdout,
                data,
            } => info!(target: BACKEND_TARGET, "{data}"),
            BackendEvent::Output {
                stream: OutputStream::Stderr,
                data,
            } => warn!(target: BACKEND_TARGET, "{data}"),
            BackendEvent::Ready {} => info!("Backend is ready"),
            BackendEvent::Crashed { code, signal } => {
                error!("Backend crashed (code={code:?}, signal={signal:?})")
            }
            BackendEvent::Error { error } => error!("Backend error: {error}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FailingSink {
        attempts: AtomicUsize,
    }

    impl EventSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn send(&self, _event: &BackendEvent) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            bail!("window went away")
        }
    }

    struct ClosableSink {
        closed: AtomicBool,
        received: AtomicUsize,
    }

    impl EventSink for ClosableSink {
        fn name(&self) -> &str {
            "closable"
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn send(&self, _event: &BackendEvent) -> Result<()> {
            self.received.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn failing_sink_does_not_block_others() {
        let relay = OutputRelay::new();
        let failing = Arc::new(FailingSink {
            attempts: AtomicUsize::new(0),
        });
        let (channel, mut receiver) = ChannelSink::new("window");
        relay.subscribe(failing.clone());
        relay.subscribe(Arc::new(channel));

        relay.broadcast(BackendEvent::Ready {});

        assert_eq!(failing.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(receiver.try_recv().unwrap(), BackendEvent::Ready {});
    }

    #[test]
    fn closed_sinks_are_skipped_and_pruned() {
        let relay = OutputRelay::new();
        let closable = Arc::new(ClosableSink {
            closed: AtomicBool::new(false),
            received: AtomicUsize::new(0),
        });
        let (channel, receiver) = ChannelSink::new("window");
        relay.subscribe(closable.clone());
        relay.subscribe(Arc::new(channel));
        assert_eq!(relay.subscriber_count(), 2);

        relay.broadcast(BackendEvent::Ready {});
        closable.closed.store(true, Ordering::SeqCst);
        drop(receiver);
        relay.broadcast(BackendEvent::Ready {});

        assert_eq!(closable.received.load(Ordering::SeqCst), 1);
        assert_eq!(relay.subscriber_count(), 0);
    }

    #[test]
    fn late_subscribers_miss_earlier_events() {
        let relay = OutputRelay::new();
        relay.broadcast(BackendEvent::Error {
            error: "early".to_string(),
        });

        let (channel, mut receiver) = ChannelSink::new("late");
        relay.subscribe(Arc::new(channel));
        relay.broadcast(BackendEvent::Ready {});

        assert_eq!(receiver.try_recv().unwrap(), BackendEvent::Ready {});
        assert!(receiver.try_recv().is_err());
    }
}
