//! Engine-wide stop signal.

use tokio::sync::watch;

/// Receiver side held by every background loop.
pub type ShutdownRx = watch::Receiver<bool>;

/// Resolve once shutdown is requested or the engine is dropped.
///
/// Cancel-safe, so it can sit in a `select!` next to socket reads.
pub async fn requested(rx: &mut ShutdownRx) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_resolves_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { requested(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_resolves_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), requested(&mut rx))
            .await
            .unwrap();
    }
}
