//! Bounded background task queue
//!
//! One worker task drains a bounded channel, so writes submitted through a queue are
//! applied one at a time in submission order. `try_submit` drops the job when the
//! queue is full; `submit` waits for room. Handler failures are logged, never returned.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};

enum Message<T> {
    Job(T),
    Flush(oneshot::Sender<()>),
}

pub struct BackgroundQueue<T> {
    name: &'static str,
    tx: mpsc::Sender<Message<T>>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for BackgroundQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T: Send + 'static> BackgroundQueue<T> {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn spawn<H, Fut>(name: &'static str, capacity: usize, handler: H) -> Self
    where
        H: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Message<T>>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Job(job) => {
                        if let Err(e) = handler(job).await {
                            warn!(queue = name, error = %e, "Background task failed");
                        }
                    }
                    Message::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            debug!(queue = name, "Background queue closed");
        });

        Self {
            name,
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue without waiting. Returns false if the job was dropped.
    pub fn try_submit(&self, job: T) -> bool {
        match self.tx.try_send(Message::Job(job)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(queue = self.name, dropped, "Queue full, dropping job");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(queue = self.name, "Queue closed, dropping job");
                false
            }
        }
    }

    /// Enqueue, waiting for room
    pub async fn submit(&self, job: T) -> Result<()> {
        self.tx
            .send(Message::Job(job))
            .await
            .map_err(|_| Error::InvalidData(format!("{} queue is closed", self.name)))
    }

    /// Wait until every job submitted before this call has been handled
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Message::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Jobs dropped by `try_submit` since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
