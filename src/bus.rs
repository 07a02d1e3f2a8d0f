//! The relocation bus: an unbounded stream of [`RelocateShard`] work items
//! from the supervisor-side producers to the queue consumer, with a yield
//! bridge in between so producers cannot starve the rest of the task tree.

use crate::error::{DistributorError, Result};
use crate::shard::RelocateShard;
use log::debug;
use tokio::sync::mpsc;

pub struct RelocationSender {
    tx: mpsc::UnboundedSender<RelocateShard>,
}

impl Clone for RelocationSender {
    fn clone(&self) -> Self {
        RelocationSender { tx: self.tx.clone() }
    }
}

impl RelocationSender {
    /// Enqueues a work item; delivery is exactly-once per send.
    pub fn send(&self, relocation: RelocateShard) -> Result<()> {
        self.tx.send(relocation).map_err(|_| DistributorError::BrokenPromise)
    }
}

pub struct RelocationReceiver {
    rx: mpsc::UnboundedReceiver<RelocateShard>,
}

impl RelocationReceiver {
    /// Receives the next item; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<RelocateShard> {
        self.rx.recv().await
    }

    /// Drains whatever is immediately available without waiting.
    pub fn drain_ready(&mut self) -> Vec<RelocateShard> {
        let mut items = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            items.push(item);
        }
        items
    }
}

pub fn channel() -> (RelocationSender, RelocationReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RelocationSender { tx }, RelocationReceiver { rx })
}

/// Forwards items from the producer side to the consumer side in FIFO
/// order, yielding after each so sibling tasks get scheduled between
/// deliveries. Resolves once the producer side closes.
pub async fn yield_bridge(mut from: RelocationReceiver, to: RelocationSender) -> Result<()> {
    let mut forwarded: u64 = 0;
    while let Some(item) = from.recv().await {
        to.send(item)?;
        forwarded += 1;
        tokio::task::yield_now().await;
    }
    debug!("event=relocation_bridge_closed forwarded={forwarded}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::{Key, KeyRange};
    use crate::shard::MoveReason;

    fn item(begin: &str, end: &str) -> RelocateShard {
        RelocateShard::new(
            KeyRange::new(Key::from(begin), Key::from(end)),
            MoveReason::RecoverMove,
        )
    }

    #[tokio::test]
    async fn bridge_preserves_fifo_order() {
        let (producer_tx, producer_rx) = channel();
        let (consumer_tx, mut consumer_rx) = channel();
        let bridge = tokio::spawn(yield_bridge(producer_rx, consumer_tx));
        producer_tx.send(item("a", "b")).unwrap();
        producer_tx.send(item("b", "c")).unwrap();
        producer_tx.send(item("c", "d")).unwrap();
        drop(producer_tx);
        bridge.await.unwrap().unwrap();
        let begins: Vec<Key> =
            consumer_rx.drain_ready().into_iter().map(|r| r.keys.begin).collect();
        assert_eq!(begins, vec![Key::from("a"), Key::from("b"), Key::from("c")]);
    }

    #[tokio::test]
    async fn send_after_receiver_dropped_is_a_broken_promise() {
        let (tx, rx) = channel();
        drop(rx);
        assert_eq!(tx.send(item("a", "b")).unwrap_err(), DistributorError::BrokenPromise);
    }
}
