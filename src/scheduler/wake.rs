//! Single-slot wake signal for the poller loops.
//!
//! Posting never blocks: if a wake is already pending the new one is dropped,
//! so a burst of updates collapses into one re-evaluation. Updates are whole
//! snapshots, so the loop reading "latest state" on wake loses nothing.

use tokio::sync::mpsc;

/// Create a connected sender/receiver pair with one pending slot.
pub fn wake_channel() -> (WakeSender, WakeReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (WakeSender(tx), WakeReceiver(rx))
}

#[derive(Debug, Clone)]
pub struct WakeSender(mpsc::Sender<()>);

impl WakeSender {
    /// Post a wake. Dropped when one is already pending or the loop is gone.
    pub fn signal(&self) {
        let _ = self.0.try_send(());
    }
}

#[derive(Debug)]
pub struct WakeReceiver(mpsc::Receiver<()>);

impl WakeReceiver {
    /// Wait for the pending wake. Returns false once every sender is dropped.
    pub async fn recv(&mut self) -> bool {
        self.0.recv().await.is_some()
    }

    /// Consume a pending wake without waiting.
    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> bool {
        self.0.try_recv().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signals_coalesce() {
        let (tx, mut rx) = wake_channel();
        tx.signal();
        tx.signal();
        tx.clone().signal();

        assert!(rx.try_recv());
        assert!(!rx.try_recv());

        // Slot is free again after consumption.
        tx.signal();
        assert!(rx.try_recv());
        assert!(!rx.try_recv());
    }

    #[tokio::test]
    async fn test_recv_wakes_waiting_loop() {
        let (tx, mut rx) = wake_channel();
        let waiter = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.signal();
        let woke = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(woke);
    }

    #[tokio::test]
    async fn test_recv_reports_closed() {
        let (tx, mut rx) = wake_channel();
        drop(tx);
        assert!(!rx.recv().await);
    }
}
