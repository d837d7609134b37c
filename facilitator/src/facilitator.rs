//! Lifecycle of the whole pipeline: the executors of both chains and the event feed subscriptions.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use error_stack::{report, Result, ResultExt};
use strum::Display;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use valuable::Valuable;

use crate::event_sub::Subscriber;
use crate::executor::Executor;
use crate::report::{collect_errors, LoggableError};
use crate::types::Chain;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: State,
    },
    #[error("failed to start the {0} executor")]
    StartExecutor(Chain),
    #[error("failed to stop the {0} executor")]
    StopExecutor(Chain),
    #[error("failed to subscribe to the {0} event feed")]
    Subscribe(Chain),
    #[error("failed to unsubscribe from the {0} event feed")]
    Unsubscribe(Chain),
    #[error("subscription restart task failed")]
    RestartTask,
}

struct Inner<E, S> {
    origin_executor: E,
    auxiliary_executor: E,
    origin_subscriber: S,
    auxiliary_subscriber: S,
}

impl<E, S> Inner<E, S>
where
    E: Executor,
    S: Subscriber,
{
    async fn start_executors(&self) -> Result<(), Error> {
        self.origin_executor
            .start()
            .await
            .change_context(Error::StartExecutor(Chain::Origin))?;
        self.auxiliary_executor
            .start()
            .await
            .change_context(Error::StartExecutor(Chain::Auxiliary))
    }

    async fn stop_executors(&self) -> Result<(), Error> {
        let origin = self
            .origin_executor
            .stop()
            .await
            .change_context(Error::StopExecutor(Chain::Origin));
        let auxiliary = self
            .auxiliary_executor
            .stop()
            .await
            .change_context(Error::StopExecutor(Chain::Auxiliary));

        collect_errors([origin, auxiliary])
    }

    async fn subscribe(&self) -> Result<(), Error> {
        self.origin_subscriber
            .subscribe()
            .await
            .change_context(Error::Subscribe(Chain::Origin))?;
        self.auxiliary_subscriber
            .subscribe()
            .await
            .change_context(Error::Subscribe(Chain::Auxiliary))
    }

    async fn unsubscribe(&self) -> Result<(), Error> {
        let origin = self
            .origin_subscriber
            .unsubscribe()
            .await
            .change_context(Error::Unsubscribe(Chain::Origin));
        let auxiliary = self
            .auxiliary_subscriber
            .unsubscribe()
            .await
            .change_context(Error::Unsubscribe(Chain::Auxiliary));

        collect_errors([origin, auxiliary])
    }

    /// Unlike [Self::subscribe], a failing origin feed does not keep the auxiliary feed down.
    async fn resubscribe(&self) -> Result<(), Error> {
        let unsubscribed = self.unsubscribe().await;
        let origin = self
            .origin_subscriber
            .subscribe()
            .await
            .change_context(Error::Subscribe(Chain::Origin));
        let auxiliary = self
            .auxiliary_subscriber
            .subscribe()
            .await
            .change_context(Error::Subscribe(Chain::Auxiliary));

        collect_errors([unsubscribed, origin, auxiliary])
    }
}

struct RestartTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the executors and subscribers of both chains and moves them through their lifecycle
/// together. Lifecycle operations never overlap.
pub struct Facilitator<E, S> {
    inner: Arc<Inner<E, S>>,
    restart_interval: Duration,
    state: StdMutex<State>,
    restart_task: Mutex<Option<RestartTask>>,
    shutdown: CancellationToken,
}

impl<E, S> Facilitator<E, S>
where
    E: Executor + 'static,
    S: Subscriber + 'static,
{
    /// A zero `restart_interval` disables the periodic resubscription.
    pub fn new(
        origin_executor: E,
        auxiliary_executor: E,
        origin_subscriber: S,
        auxiliary_subscriber: S,
        restart_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                origin_executor,
                auxiliary_executor,
                origin_subscriber,
                auxiliary_subscriber,
            }),
            restart_interval,
            state: StdMutex::new(State::Stopped),
            restart_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: State) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub async fn start(&self) -> Result<(), Error> {
        let mut restart_task = self.restart_task.lock().await;

        let state = self.state();
        if state != State::Stopped {
            return Err(report!(Error::InvalidState {
                operation: "start",
                state
            }));
        }
        self.set_state(State::Starting);

        let started = match self.inner.start_executors().await {
            Ok(()) => self.inner.subscribe().await,
            Err(err) => Err(err),
        };

        if let Err(err) = started {
            if let Err(unwind_err) = self.unwind().await {
                warn!(
                    err = LoggableError::from(&unwind_err).as_value(),
                    "failed to stop partially started facilitator"
                );
            }
            self.set_state(State::Stopped);

            return Err(err);
        }

        *restart_task = self.spawn_restart_task();
        self.set_state(State::Running);
        info!("facilitator started");

        Ok(())
    }

    async fn unwind(&self) -> Result<(), Error> {
        let executors = self.inner.stop_executors().await;
        let subscriptions = self.inner.unsubscribe().await;

        collect_errors([executors, subscriptions])
    }

    /// Stops every component even if some of them fail to stop. All failures are reported together.
    pub async fn stop(&self) -> Result<(), Error> {
        let mut restart_task = self.restart_task.lock().await;

        if self.state() == State::Stopped {
            return Ok(());
        }
        self.set_state(State::Stopping);

        let executors = self.inner.stop_executors().await;
        let restarts = match restart_task.take() {
            Some(RestartTask { token, handle }) => {
                token.cancel();
                handle.await.change_context(Error::RestartTask)
            }
            None => Ok(()),
        };
        let subscriptions = self.inner.unsubscribe().await;

        self.set_state(State::Stopped);
        info!("facilitator stopped");

        collect_errors([executors, restarts, subscriptions])
    }

    fn spawn_restart_task(&self) -> Option<RestartTask> {
        if self.restart_interval.is_zero() {
            return None;
        }

        let token = self.shutdown.child_token();
        let handle = tokio::spawn(restart_subscriptions(
            self.inner.clone(),
            self.restart_interval,
            token.clone(),
        ));

        Some(RestartTask { token, handle })
    }
}

impl<E, S> Drop for Facilitator<E, S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn restart_subscriptions<E, S>(
    inner: Arc<Inner<E, S>>,
    restart_interval: Duration,
    token: CancellationToken,
) where
    E: Executor,
    S: Subscriber,
{
    // skip the immediate first tick, the subscriptions were just opened
    let mut interval = time::interval_at(Instant::now() + restart_interval, restart_interval);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                match inner.resubscribe().await {
                    Ok(()) => info!("restarted event feed subscriptions"),
                    Err(err) => warn!(
                        err = LoggableError::from(&err).as_value(),
                        "failed to restart event feed subscriptions"
                    ),
                }
            }
        }
    }
}
