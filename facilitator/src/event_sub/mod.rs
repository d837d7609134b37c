use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::{Result, ResultExt};
use futures::stream::BoxStream;
use futures::StreamExt;
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;
use valuable::Valuable;

use crate::handlers::{self, HandlerRegistry};
use crate::report::LoggableError;
use crate::types::Chain;

mod subgraph;

pub use subgraph::SubgraphFeed;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to reach the event feed")]
    Transport,
    #[error("event feed rejected the query for {0}")]
    Query(EntityKind),
    #[error("event feed returned an invalid response for {0}")]
    InvalidResponse(EntityKind),
    #[error("feed consumer stopped abnormally")]
    Consumer,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Maximum number of records fetched per entity and poll.
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
        }
    }
}

/// Contract event kinds delivered by the feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    DeclaredDepositIntents,
    ConfirmedDepositIntents,
    DeclaredWithdrawIntents,
    ConfirmedWithdrawIntents,
    CreatedUtilityTokens,
}

impl EntityKind {
    /// Event kinds emitted by the contracts of `chain`.
    pub fn emitted_on(chain: Chain) -> Vec<EntityKind> {
        match chain {
            Chain::Origin => vec![
                EntityKind::DeclaredDepositIntents,
                EntityKind::ConfirmedWithdrawIntents,
            ],
            Chain::Auxiliary => vec![
                EntityKind::ConfirmedDepositIntents,
                EntityKind::DeclaredWithdrawIntents,
                EntityKind::CreatedUtilityTokens,
            ],
        }
    }
}

/// Batch of decoded records of one entity kind.
#[derive(Clone, Debug, PartialEq)]
pub struct FeedUpdate {
    pub entity: EntityKind,
    pub records: Vec<Value>,
    /// Feed position of the last record in the batch.
    pub position: u64,
}

pub type FeedStream = BoxStream<'static, Result<FeedUpdate, Error>>;

/// Transport delivering contract event records. Delivery is at least once: records are delivered
/// again, also to later subscriptions, until they are acknowledged.
#[automock]
#[async_trait]
pub trait EventFeed: Send + Sync {
    async fn subscribe(&self, entities: Vec<EntityKind>) -> Result<FeedStream, Error>;

    /// Moves the feed of `entity` past `position`.
    fn acknowledge(&self, entity: EntityKind, position: u64);
}

#[automock]
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self) -> Result<(), Error>;
    async fn unsubscribe(&self) -> Result<(), Error>;
}

struct Consumer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Keeps one feed subscription of a chain alive and hands its updates to the event handlers.
#[derive(TypedBuilder)]
pub struct FeedSubscriber<F> {
    chain: Chain,
    feed: Arc<F>,
    registry: Arc<HandlerRegistry>,
    #[builder(default = EntityKind::emitted_on(chain))]
    entities: Vec<EntityKind>,
    #[builder(default, setter(skip))]
    consumer: Mutex<Option<Consumer>>,
}

#[async_trait]
impl<F> Subscriber for FeedSubscriber<F>
where
    F: EventFeed + 'static,
{
    async fn subscribe(&self) -> Result<(), Error> {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            debug!(chain = %self.chain, "feed already subscribed");
            return Ok(());
        }

        let stream = self.feed.subscribe(self.entities.clone()).await?;
        let token = CancellationToken::new();
        let handle = tokio::spawn(consume_updates(
            self.chain,
            self.feed.clone(),
            stream,
            self.registry.clone(),
            token.clone(),
        ));
        *consumer = Some(Consumer { token, handle });

        info!(chain = %self.chain, "subscribed to event feed");

        Ok(())
    }

    /// Stops consuming the feed. An update that is being handled is processed to the end first.
    async fn unsubscribe(&self) -> Result<(), Error> {
        let Some(Consumer { token, handle }) = self.consumer.lock().await.take() else {
            return Ok(());
        };

        token.cancel();
        handle.await.change_context(Error::Consumer)?;

        info!(chain = %self.chain, "unsubscribed from event feed");

        Ok(())
    }
}

async fn consume_updates<F>(
    chain: Chain,
    feed: Arc<F>,
    mut stream: FeedStream,
    registry: Arc<HandlerRegistry>,
    token: CancellationToken,
) where
    F: EventFeed,
{
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(update)) => {
                let entity = update.entity;
                let position = update.position;
                let count = update.records.len();

                match registry.dispatch(update).await {
                    Ok(()) => {
                        debug!(%chain, %entity, position, count, "handled feed update");
                        feed.acknowledge(entity, position);
                    }
                    Err(err) if handlers::Error::is_retryable(&err) => warn!(
                        err = LoggableError::from(&err).as_value(),
                        %chain,
                        %entity,
                        position,
                        "failed to handle feed update, waiting for redelivery"
                    ),
                    Err(err) => {
                        warn!(
                            err = LoggableError::from(&err).as_value(),
                            %chain,
                            %entity,
                            position,
                            "failed to handle feed update"
                        );
                        feed.acknowledge(entity, position);
                    }
                }
            }
            Some(Err(err)) => {
                warn!(
                    err = LoggableError::from(&err).as_value(),
                    %chain,
                    "event feed delivered an error"
                )
            }
            None => {
                info!(%chain, "event feed closed");
                break;
            }
        }
    }
}
