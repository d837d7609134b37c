use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use error_stack::Result;
use thiserror::Error;
use tracing::warn;
use valuable::Valuable;

use crate::report::LoggableError;

#[derive(Error, Debug)]
#[error("observer failed to process an update")]
pub struct Error;

/// Reactor interested in changes of `T`.
#[async_trait]
pub trait Observer<T>: Send + Sync {
    async fn update(&self, item: &T) -> Result<(), Error>;
}

pub type ObserverId = u64;

/// Fans updates out to every attached observer, in attach order.
pub struct Subject<T> {
    observers: RwLock<Vec<(ObserverId, Arc<dyn Observer<T>>)>>,
    next_id: AtomicU64,
}

impl<T> Default for Subject<T> {
    fn default() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> Subject<T>
where
    T: Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, observer: Arc<dyn Observer<T>>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));

        id
    }

    /// Returns false if no observer with this id was attached.
    pub fn detach(&self, id: ObserverId) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let count = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);

        observers.len() != count
    }

    /// Delivers `item` to all observers attached at the time of the call. A failing observer is logged
    /// and does not keep the others from receiving the update.
    pub async fn notify(&self, item: &T) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (id, observer) in observers {
            if let Err(err) = observer.update(item).await {
                warn!(
                    err = LoggableError::from(&err).as_value(),
                    observer = id,
                    "observer failed to process update"
                );
            }
        }
    }
}
