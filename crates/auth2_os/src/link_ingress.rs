#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const SIGNAL_CAPACITY: usize = 16;

/// Wake-up carrying no payload. The link itself is fetched with
/// `LinkIngestionBuffer::take_latest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSignal;

#[derive(Debug)]
struct LinkInner {
    pending: Mutex<Option<String>>,
    signal: broadcast::Sender<LinkSignal>,
}

/// Single-slot mailbox for enrollment links that may arrive before anyone is
/// listening. Holds at most one unconsumed link; the newest one wins.
#[derive(Debug, Clone)]
pub struct LinkIngestionBuffer {
    inner: Arc<LinkInner>,
}

impl Default for LinkIngestionBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkIngestionBuffer {
    pub fn new() -> Self {
        let (signal, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            inner: Arc::new(LinkInner {
                pending: Mutex::new(None),
                signal,
            }),
        }
    }

    /// Stores `url` (discarding any unconsumed one), then wakes every
    /// current subscriber. The URL is never logged.
    pub fn deliver(&self, url: impl Into<String>) {
        let replaced = self.slot().replace(url.into()).is_some();
        let receivers = self.inner.signal.send(LinkSignal).unwrap_or(0);
        tracing::debug!(replaced, receivers, "enrollment link buffered");
    }

    /// Atomic read-and-clear.
    pub fn take_latest(&self) -> Option<String> {
        self.slot().take()
    }

    pub fn has_pending(&self) -> bool {
        self.slot().is_some()
    }

    pub fn subscribe(&self) -> LinkSubscription {
        LinkSubscription {
            rx: self.inner.signal.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.signal.receiver_count()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        // Poison is ignored: the slot is a plain Option.
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct LinkSubscription {
    rx: broadcast::Receiver<LinkSignal>,
}

impl LinkSubscription {
    /// Waits for the next delivery. `false` once the buffer is gone.
    pub async fn wait(&mut self) -> bool {
        match self.rx.recv().await {
            Ok(LinkSignal) => true,
            Err(RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "link subscriber lagged");
                true
            }
            Err(RecvError::Closed) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LinkIngestionBuffer, SIGNAL_CAPACITY};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn at_link_01_last_write_wins_and_take_clears() {
        let buf = LinkIngestionBuffer::new();
        buf.deliver("otpauth://totp/a?secret=AAAA");
        buf.deliver("otpauth://totp/b?secret=BBBB");
        buf.deliver("otpauth://totp/c?secret=CCCC");
        assert!(buf.has_pending());
        assert_eq!(
            buf.take_latest().as_deref(),
            Some("otpauth://totp/c?secret=CCCC")
        );
        assert_eq!(buf.take_latest(), None);
        assert!(!buf.has_pending());
    }

    #[test]
    fn at_link_02_delivery_without_subscribers_is_kept() {
        let buf = LinkIngestionBuffer::new();
        assert_eq!(buf.subscriber_count(), 0);
        buf.deliver("x");
        assert_eq!(buf.take_latest().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn at_link_03_every_subscriber_woken_per_delivery() {
        let buf = LinkIngestionBuffer::new();
        let mut a = buf.subscribe();
        let mut b = buf.subscribe();
        buf.deliver("one");
        buf.deliver("two");
        for _ in 0..2 {
            assert!(a.wait().await);
            assert!(b.wait().await);
        }
        // Both woke twice; only one value is left to take.
        assert_eq!(buf.take_latest().as_deref(), Some("two"));
        assert_eq!(buf.take_latest(), None);
    }

    #[tokio::test]
    async fn at_link_04_lagged_subscriber_still_wakes() {
        let buf = LinkIngestionBuffer::new();
        let mut sub = buf.subscribe();
        for i in 0..(SIGNAL_CAPACITY + 4) {
            buf.deliver(format!("link-{i}"));
        }
        assert!(sub.wait().await);
        assert_eq!(
            buf.take_latest(),
            Some(format!("link-{}", SIGNAL_CAPACITY + 3))
        );
    }

    #[tokio::test]
    async fn at_link_05_wait_ends_when_buffer_dropped() {
        let buf = LinkIngestionBuffer::new();
        let mut sub = buf.subscribe();
        drop(buf);
        let woke = tokio::time::timeout(Duration::from_secs(1), sub.wait())
            .await
            .unwrap();
        assert!(!woke);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_link_06_concurrent_take_has_single_winner() {
        let buf = Arc::new(LinkIngestionBuffer::new());
        buf.deliver("only");
        let mut handles = Vec::new();
        for _ in 0..16 {
            let b = Arc::clone(&buf);
            handles.push(tokio::spawn(async move { b.take_latest() }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
