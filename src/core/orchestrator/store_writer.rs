//! Ordered access to the session store.
//!
//! Every store call the orchestrator makes is queued here and run by one task,
//! one call at a time, in submission order. State updates are fire-and-forget;
//! calls that need an answer await it through [`StoreWriter::call`].

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::core::session::SessionStore;
use crate::errors::{VoiceError, VoiceResult};

type StoreJob = Box<dyn FnOnce(Arc<dyn SessionStore>) -> BoxFuture<'static, ()> + Send>;

pub(super) struct StoreWriter {
    store: Arc<dyn SessionStore>,
    queue: Mutex<Option<mpsc::UnboundedSender<StoreJob>>>,
}

impl StoreWriter {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            queue: Mutex::new(None),
        }
    }

    /// Queue a write without waiting for it.
    pub fn submit<F, Fut>(&self, write: F)
    where
        F: FnOnce(Arc<dyn SessionStore>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(Box::new(move |store| Box::pin(write(store))));
    }

    /// Queue a store call and wait for its result.
    pub async fn call<T, F, Fut>(&self, op: F) -> VoiceResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn SessionStore>) -> Fut + Send + 'static,
        Fut: Future<Output = VoiceResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(move |store| async move {
            let _ = tx.send(op(store).await);
        });
        rx.await
            .map_err(|_| VoiceError::Persistence("session store writer stopped".to_string()))?
    }

    /// The queue task is started on first use so construction needs no runtime.
    fn enqueue(&self, job: StoreJob) {
        let mut queue = self.queue.lock();
        let job = match queue.as_ref() {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_queue(self.store.clone(), rx));
        let _ = tx.send(job);
        *queue = Some(tx);
    }
}

async fn run_queue(store: Arc<dyn SessionStore>, mut rx: mpsc::UnboundedReceiver<StoreJob>) {
    while let Some(job) = rx.recv().await {
        job(store.clone()).await;
    }
    debug!("Session store queue closed");
}
