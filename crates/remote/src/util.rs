//! Small channel plumbing shared by the pipeline crates.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// Multi-consumer wrapper over one bounded receiver so a fan-out stage can
/// share a single upstream channel.
pub struct SharedReceiver<T> {
    inner: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for SharedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SharedReceiver<T> {
    pub fn new(receiver: mpsc::Receiver<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Next message, or None once the channel is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        self.inner.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_consumers_split_the_stream() {
        let (tx, rx) = mpsc::channel(8);
        let shared = SharedReceiver::new(rx);
        for value in 0..6 {
            tx.send(value).await.unwrap();
        }
        drop(tx);

        let a = shared.clone();
        let b = shared.clone();
        let (left, right) = tokio::join!(
            async move {
                let mut seen = Vec::new();
                while let Some(v) = a.recv().await {
                    seen.push(v);
                }
                seen
            },
            async move {
                let mut seen = Vec::new();
                while let Some(v) = b.recv().await {
                    seen.push(v);
                }
                seen
            }
        );
        let mut all: Vec<i32> = left.into_iter().chain(right).collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3, 4, 5]);
    }
}
