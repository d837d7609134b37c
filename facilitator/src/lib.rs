use std::sync::Arc;

use error_stack::{Result, ResultExt};
use ethers_providers::Http;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use crate::chain::evm::EvmClient;
use crate::chain::json_rpc;
use crate::config::{ChainConfig, Config};
use crate::event_sub::{FeedSubscriber, SubgraphFeed};
use crate::executor::{Route, TransactionExecutor};
use crate::facilitator::Facilitator;
use crate::handlers::HandlerRegistry;
use crate::repositories::Repositories;
use crate::types::{Chain, Gateway, MessageType};

pub mod asyncutil;
pub mod chain;
pub mod config;
mod deserializers;
pub mod event_sub;
pub mod executor;
pub mod facilitator;
pub mod handlers;
pub mod observer;
pub mod report;
pub mod repositories;
pub mod storage;
pub mod types;
pub mod url;

type Client = EvmClient<Http>;
type Executor = TransactionExecutor<Client>;
type Subscriber = FeedSubscriber<SubgraphFeed>;

pub async fn run(cfg: Config) -> Result<(), Error> {
    prepare_app(cfg).await?.run().await
}

async fn prepare_app(cfg: Config) -> Result<App, Error> {
    let Config {
        database_url,
        restart_interval,
        executor,
        feed,
        origin,
        auxiliary,
    } = cfg;

    let db = storage::connect(database_url.as_str())
        .await
        .change_context(Error::Database)
        .attach_printable(database_url.clone())?;
    storage::create_tables(&db)
        .await
        .change_context(Error::Database)?;

    let repositories = Repositories::new(db);
    register_gateways(&repositories, &origin, &auxiliary).await?;

    let origin_client = Arc::new(evm_client(&origin));
    let auxiliary_client = Arc::new(evm_client(&auxiliary));

    // deposits are declared on origin and confirmed on auxiliary, withdraws go the other way
    let auxiliary_executor = TransactionExecutor::new(
        Route {
            message_type: MessageType::Deposit,
            source_gateway: origin.gateway,
            target_gateway: auxiliary.gateway,
            anchor: auxiliary.anchor,
            outbox_storage_index: origin.outbox_storage_index,
        },
        origin_client.clone(),
        auxiliary_client.clone(),
        auxiliary.worker,
        repositories.clone(),
        &executor,
    );
    let origin_executor = TransactionExecutor::new(
        Route {
            message_type: MessageType::Withdraw,
            source_gateway: auxiliary.gateway,
            target_gateway: origin.gateway,
            anchor: origin.anchor,
            outbox_storage_index: auxiliary.outbox_storage_index,
        },
        auxiliary_client,
        origin_client,
        origin.worker,
        repositories.clone(),
        &executor,
    );

    for observer in [origin_executor.observer(), auxiliary_executor.observer()]
        .into_iter()
        .flatten()
    {
        repositories.messages.subject().attach(Arc::new(observer));
    }

    let registry = Arc::new(HandlerRegistry::new(&repositories));
    let http = reqwest::Client::new();
    let origin_subscriber = FeedSubscriber::builder()
        .chain(Chain::Origin)
        .feed(Arc::new(SubgraphFeed::new(
            http.clone(),
            origin.subgraph_url.to_standard_url(),
            &feed,
        )))
        .registry(registry.clone())
        .build();
    let auxiliary_subscriber = FeedSubscriber::builder()
        .chain(Chain::Auxiliary)
        .feed(Arc::new(SubgraphFeed::new(
            http,
            auxiliary.subgraph_url.to_standard_url(),
            &feed,
        )))
        .registry(registry)
        .build();

    Ok(App {
        facilitator: Facilitator::new(
            origin_executor,
            auxiliary_executor,
            origin_subscriber,
            auxiliary_subscriber,
            restart_interval,
        ),
    })
}

/// Gateways are known from configuration. Saving them again keeps the recorded proving progress.
async fn register_gateways(
    repositories: &Repositories,
    origin: &ChainConfig,
    auxiliary: &ChainConfig,
) -> Result<(), Error> {
    for gateway in [
        Gateway::new(
            origin.gateway,
            auxiliary.gateway,
            Chain::Origin,
            origin.anchor,
        ),
        Gateway::new(
            auxiliary.gateway,
            origin.gateway,
            Chain::Auxiliary,
            auxiliary.anchor,
        ),
    ] {
        repositories
            .gateways
            .save(gateway)
            .await
            .change_context(Error::Database)?;
    }

    Ok(())
}

fn evm_client(cfg: &ChainConfig) -> Client {
    EvmClient::builder()
        .client(json_rpc::Client::new_http(&cfg.rpc_url))
        .gas_price(cfg.gas_price)
        .gas_limit(cfg.gas_limit)
        .confirmation_poll_interval(cfg.confirmation_poll_interval)
        .confirmation_timeout(cfg.confirmation_timeout)
        .build()
}

struct App {
    facilitator: Facilitator<Executor, Subscriber>,
}

impl App {
    async fn run(self) -> Result<(), Error> {
        self.facilitator
            .start()
            .await
            .change_context(Error::Facilitator)?;

        wait_for_shutdown_signal().await?;
        info!("signal received, waiting for the facilitator to stop gracefully");

        self.facilitator
            .stop()
            .await
            .change_context(Error::Facilitator)
    }
}

async fn wait_for_shutdown_signal() -> Result<(), Error> {
    let mut sigint = signal(SignalKind::interrupt()).change_context(Error::Signal)?;
    let mut sigterm = signal(SignalKind::terminate()).change_context(Error::Signal)?;

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    Ok(())
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("database setup failed")]
    Database,
    #[error("facilitator failed")]
    Facilitator,
    #[error("failed to listen for shutdown signals")]
    Signal,
    #[error("failed to load config")]
    LoadConfig,
}
