//! Durable FIFO of inbound protocol messages with a single consumer.
//!
//! Items are persisted on `push` and replayed by `start` after a restart.
//! An item is removed from storage before its handler runs, so delivery is
//! at-most-once: a handler error or a crash mid-handler drops the item.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::store::{Store, StoreExt};
use crate::types::Result;

struct Shared {
    store: Arc<dyn Store>,
    namespace: String,
    key: String,
    lock: Mutex<()>,
    notify: Notify,
}

pub struct Mailbox<T> {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    _item: PhantomData<fn() -> T>,
}

impl<T> Mailbox<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(store: Arc<dyn Store>, namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                namespace: namespace.into(),
                key: key.into(),
                lock: Mutex::new(()),
                notify: Notify::new(),
            }),
            task: Mutex::new(None),
            _item: PhantomData,
        }
    }

    pub fn push(&self, item: T) -> Result<()> {
        push_item(&self.shared, item)?;
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Remove and return the oldest item. The removal is persisted before
    /// the item is handed out.
    pub fn pop(&self) -> Result<Option<T>> {
        pop_item(&self.shared)
    }

    pub fn pending(&self) -> Result<Vec<T>> {
        load::<T>(&self.shared)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.pending()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Spawn the consumer. Items already in storage are handled first.
    pub fn start<F, Fut>(&self, mut handler: F)
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                match pop_item::<T>(&shared) {
                    Ok(Some(item)) => {
                        if let Err(err) = handler(item).await {
                            warn!(%err, "mailbox handler failed, message dropped");
                        }
                    }
                    Ok(None) => shared.notify.notified().await,
                    Err(err) => {
                        error!(%err, "mailbox read failed");
                        shared.notify.notified().await;
                    }
                }
            }
        });
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

impl<T> Drop for Mailbox<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

fn load<T: DeserializeOwned>(shared: &Shared) -> Result<Vec<T>> {
    Ok(shared
        .store
        .get_json::<Vec<T>>(&shared.namespace, &shared.key)?
        .unwrap_or_default())
}

fn push_item<T: Serialize + DeserializeOwned>(shared: &Shared, item: T) -> Result<()> {
    let _guard = shared.lock.lock();
    let mut items = load::<T>(shared)?;
    items.push(item);
    shared.store.set_json(&shared.namespace, &shared.key, &items)
}

fn pop_item<T: Serialize + DeserializeOwned>(shared: &Shared) -> Result<Option<T>> {
    let _guard = shared.lock.lock();
    let mut items = load::<T>(shared)?;
    if items.is_empty() {
        return Ok(None);
    }
    let first = items.remove(0);
    shared.store.set_json(&shared.namespace, &shared.key, &items)?;
    Ok(Some(first))
}
