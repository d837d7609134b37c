//! Confirms pending messages on their target chain.
//!
//! An executor works for one direction: it reads messages declared on the source chain, proves the
//! source gateway to the target gateway at the latest anchored height and then confirms every message
//! that was declared at or below that height.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use error_stack::{report, Report, Result, ResultExt};
use futures::future::{self, join_all};
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use valuable::Valuable;

use crate::asyncutil::future::{with_retry_if, RetryPolicy};
use crate::asyncutil::keyed_lock::KeyedLock;
use crate::chain::abi::{confirmDepositCall, confirmWithdrawCall, proveGatewayCall};
use crate::chain::proof::outbox_storage_key;
use crate::chain::{self, ChainClient};
use crate::observer::{self, Observer};
use crate::report::LoggableError;
use crate::repositories::Repositories;
use crate::types::{Hash, Message, MessageStatus, MessageType};

mod account;

pub use account::Account;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to access the message store")]
    Store,
    #[error("chain interaction failed")]
    Chain,
    #[error("gateway {0} is not registered")]
    UnknownGateway(Address),
    #[error("intent of message {0} is missing")]
    MissingIntent(Hash),
    #[error("no token pair is registered for utility token {0}")]
    MissingTokenPair(Address),
    #[error("message {0} lacks the fields required for its confirmation")]
    IncompleteMessage(Hash),
    #[error("executor task failed")]
    Task,
}

impl Error {
    /// Failures that repeating the confirmation cannot fix.
    fn is_permanent(report: &Report<Error>) -> bool {
        match report.current_context() {
            Error::MissingIntent(_) | Error::IncompleteMessage(_) => true,
            Error::Chain => report
                .downcast_ref::<chain::Error>()
                .is_some_and(|err| !err.is_transient()),
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Capacity of the pending message notification queue. Zero disables notifications.
    pub notification_buffer: usize,
    #[serde(with = "humantime_serde")]
    pub retry_initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,
    pub retry_max_attempts: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            notification_buffer: 1000,
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            retry_max_attempts: 5,
        }
    }
}

impl Config {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.retry_initial_delay,
            self.retry_max_delay,
            self.retry_max_attempts,
        )
    }
}

/// Direction of the messages an executor confirms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub message_type: MessageType,
    /// Gateway the messages are declared on.
    pub source_gateway: Address,
    /// Gateway on the target chain that receives the proofs and confirmations.
    pub target_gateway: Address,
    /// Contract on the target chain anchoring source chain state roots.
    pub anchor: Address,
    /// Storage slot index of the outbox mapping in the source gateway.
    pub outbox_storage_index: u64,
}

#[automock]
#[async_trait]
pub trait Executor: Send + Sync {
    async fn start(&self) -> Result<(), Error>;
    async fn stop(&self) -> Result<(), Error>;
}

/// Forwards messages that became pending on a route to its executor.
pub struct PendingMessageObserver {
    route: Route,
    sender: mpsc::Sender<Hash>,
}

#[async_trait]
impl Observer<Message> for PendingMessageObserver {
    async fn update(&self, message: &Message) -> Result<(), observer::Error> {
        if message.message_type != self.route.message_type
            || message.gateway_address != self.route.source_gateway
            || !message.is_pending()
        {
            return Ok(());
        }

        match self.sender.try_send(message.message_hash) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(hash)) => {
                // the next poll picks the message up
                debug!(message_hash = %hash, "notification queue is full, dropping notification");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => {
                Err(report!(observer::Error)).attach_printable("executor is gone")
            }
        }
    }
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<Option<mpsc::Receiver<Hash>>>,
}

pub struct TransactionExecutor<C> {
    inner: Arc<Inner<C>>,
    poll_interval: Duration,
    sender: Option<mpsc::Sender<Hash>>,
    notifications: Mutex<Option<mpsc::Receiver<Hash>>>,
    running: Mutex<Option<Running>>,
}

/// Transaction an executor sends on the target chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Action {
    ProveGateway(u64),
    Confirm(Hash),
}

struct Inner<C> {
    route: Route,
    source: Arc<C>,
    target: Arc<C>,
    account: Account<C>,
    repositories: Repositories,
    retry_policy: RetryPolicy,
    in_flight: KeyedLock<Hash>,
    proving: Mutex<()>,
    /// Messages that failed permanently and are still pending. Held in memory only, so after a process
    /// restart each of them is attempted once more.
    failed: StdMutex<HashSet<Hash>>,
    /// Broadcast transactions whose receipt has not been seen yet. A later attempt of the same action
    /// waits for them instead of broadcasting again.
    broadcasts: StdMutex<HashMap<Action, Hash>>,
}

impl<C> TransactionExecutor<C>
where
    C: ChainClient + 'static,
{
    /// `source` and `target` talk to the chains the route's messages come from and go to. Transactions
    /// are signed by `signer` on the target chain.
    pub fn new(
        route: Route,
        source: Arc<C>,
        target: Arc<C>,
        signer: Address,
        repositories: Repositories,
        config: &Config,
    ) -> Self {
        let (sender, notifications) = match config.notification_buffer {
            0 => (None, None),
            capacity => {
                let (sender, receiver) = mpsc::channel(capacity);
                (Some(sender), Some(receiver))
            }
        };

        Self {
            inner: Arc::new(Inner {
                route,
                account: Account::new(target.clone(), signer),
                source,
                target,
                repositories,
                retry_policy: config.retry_policy(),
                in_flight: KeyedLock::new(),
                proving: Mutex::new(()),
                failed: StdMutex::default(),
                broadcasts: StdMutex::default(),
            }),
            poll_interval: config.poll_interval,
            sender,
            notifications: Mutex::new(notifications),
            running: Mutex::new(None),
        }
    }

    /// Observer to attach to the message store so newly pending messages are handled without waiting
    /// for the next poll. `None` if notifications are disabled.
    pub fn observer(&self) -> Option<PendingMessageObserver> {
        self.sender.clone().map(|sender| PendingMessageObserver {
            route: self.inner.route,
            sender,
        })
    }

    /// Pending messages whose confirmation failed permanently. They are not attempted again.
    pub fn failed_messages(&self) -> HashSet<Hash> {
        self.inner
            .failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl<C> Executor for TransactionExecutor<C>
where
    C: ChainClient + 'static,
{
    async fn start(&self) -> Result<(), Error> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run(
            self.inner.clone(),
            self.poll_interval,
            self.notifications.lock().await.take(),
            token.clone(),
        ));
        *running = Some(Running { token, handle });

        info!(route = ?self.inner.route, "executor started");

        Ok(())
    }

    /// Returns once all confirmations in flight have finished.
    async fn stop(&self) -> Result<(), Error> {
        let mut running = self.running.lock().await;
        let Some(Running { token, handle }) = running.take() else {
            return Ok(());
        };

        token.cancel();
        *self.notifications.lock().await = handle.await.change_context(Error::Task)?;

        info!(route = ?self.inner.route, "executor stopped");

        Ok(())
    }
}

async fn run<C>(
    inner: Arc<Inner<C>>,
    poll_interval: Duration,
    mut notifications: Option<mpsc::Receiver<Hash>>,
    token: CancellationToken,
) -> Option<mpsc::Receiver<Hash>>
where
    C: ChainClient + 'static,
{
    let mut interval = time::interval(poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let inner = inner.clone();
                tasks.spawn(async move { inner.process_pending().await });
            }
            Some(message_hash) = next_notification(&mut notifications) => {
                let inner = inner.clone();
                tasks.spawn(async move { inner.process_notified(message_hash).await });
            }
            Some(result) = tasks.join_next() => log_cycle(result),
        }
    }

    while let Some(result) = tasks.join_next().await {
        log_cycle(result);
    }

    notifications
}

async fn next_notification(notifications: &mut Option<mpsc::Receiver<Hash>>) -> Option<Hash> {
    match notifications {
        Some(receiver) => receiver.recv().await,
        None => future::pending().await,
    }
}

fn log_cycle(result: std::result::Result<Result<(), Error>, JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(
            err = LoggableError::from(&err).as_value(),
            "executor cycle failed"
        ),
        Err(err) => error!(%err, "executor cycle panicked"),
    }
}

fn is_transient(err: &Report<chain::Error>) -> bool {
    err.current_context().is_transient()
}

impl<C> Inner<C>
where
    C: ChainClient + 'static,
{
    async fn process_pending(&self) -> Result<(), Error> {
        let height = self.anchored_height().await?;

        let pending = self
            .repositories
            .messages
            .list_pending(self.route.source_gateway, self.route.message_type, height)
            .await
            .change_context(Error::Store)?;
        self.forget_failures_except(&pending);
        if pending.is_empty() {
            return Ok(());
        }

        let Some(proven_height) = self.ensure_gateway_proven(height).await? else {
            return Ok(());
        };

        join_all(
            pending
                .iter()
                .filter(|message| message.is_ready_at(proven_height))
                .map(|message| self.confirm(message.message_hash, proven_height)),
        )
        .await;

        Ok(())
    }

    async fn process_notified(&self, message_hash: Hash) -> Result<(), Error> {
        let height = self.anchored_height().await?;

        let ready = self
            .repositories
            .messages
            .get(message_hash)
            .await
            .change_context(Error::Store)?
            .is_some_and(|message| message.is_ready_at(height));
        if !ready {
            debug!(%message_hash, height, "notified message is not anchored yet");
            return Ok(());
        }

        if let Some(proven_height) = self.ensure_gateway_proven(height).await? {
            self.confirm(message_hash, proven_height).await;
        }

        Ok(())
    }

    async fn anchored_height(&self) -> Result<u64, Error> {
        with_retry_if(
            || self.target.latest_anchored_block_number(self.route.anchor),
            self.retry_policy,
            is_transient,
        )
        .await
        .change_context(Error::Chain)
    }

    async fn last_proven_height(&self) -> Result<Option<u64>, Error> {
        self.repositories
            .gateways
            .get(self.route.target_gateway)
            .await
            .change_context(Error::Store)?
            .ok_or(report!(Error::UnknownGateway(self.route.target_gateway)))
            .map(|gateway| gateway.remote_gateway_last_proven_block_number)
    }

    /// Proves the source gateway at `height` unless it is proven there already. Returns the height the
    /// gateway is proven at, which is lower than `height` while another cycle is still proving.
    async fn ensure_gateway_proven(&self, height: u64) -> Result<Option<u64>, Error> {
        let last_proven = self.last_proven_height().await?;
        if last_proven.is_some_and(|proven| proven >= height) {
            return Ok(last_proven);
        }

        let Ok(_proving) = self.proving.try_lock() else {
            debug!(height, "gateway proof already in progress");
            return Ok(last_proven);
        };

        // another cycle might have finished proving while this one was waiting for the lock
        let last_proven = self.last_proven_height().await?;
        if last_proven.is_some_and(|proven| proven >= height) {
            return Ok(last_proven);
        }

        let proof = with_retry_if(
            || self.source.proof(self.route.source_gateway, vec![], height),
            self.retry_policy,
            is_transient,
        )
        .await
        .change_context(Error::Chain)?;

        let call = proveGatewayCall {
            blockNumber: U256::from(height),
            rlpAccount: proof.encoded_account(),
            rlpParentNodes: proof.encoded_account_proof(),
        };
        let receipt = self
            .submit(Action::ProveGateway(height), call.abi_encode().into())
            .await?;

        self.repositories
            .gateways
            .set_last_proven_block_number(self.route.target_gateway, height)
            .await
            .change_context(Error::Store)?;

        info!(
            gateway = %self.route.source_gateway,
            height,
            transaction_hash = %receipt.transaction_hash,
            "proved gateway"
        );

        Ok(Some(height))
    }

    async fn confirm(&self, message_hash: Hash, proven_height: u64) {
        let Err(err) = self.confirm_message(message_hash, proven_height).await else {
            return;
        };

        if Error::is_permanent(&err) {
            self.failed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(message_hash);
            error!(
                err = LoggableError::from(&err).as_value(),
                %message_hash,
                "message confirmation failed permanently"
            );
        } else {
            warn!(
                err = LoggableError::from(&err).as_value(),
                %message_hash,
                "message confirmation failed, retrying with the next cycle"
            );
        }
    }

    /// Drops failures of messages that are no longer pending, e.g. because they were confirmed by
    /// someone else.
    fn forget_failures_except(&self, pending: &[Message]) {
        let pending: HashSet<_> = pending.iter().map(|message| message.message_hash).collect();

        self.failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|message_hash| pending.contains(message_hash));
    }

    fn has_failed(&self, message_hash: &Hash) -> bool {
        self.failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(message_hash)
    }

    async fn confirm_message(&self, message_hash: Hash, proven_height: u64) -> Result<(), Error> {
        let Some(_guard) = self.in_flight.try_lock(message_hash) else {
            debug!(%message_hash, "message is already being confirmed");
            return Ok(());
        };

        if self.has_failed(&message_hash) {
            return Ok(());
        }

        // the store might have changed since the message was listed
        let Some(message) = self
            .repositories
            .messages
            .get(message_hash)
            .await
            .change_context(Error::Store)?
            .filter(|message| message.is_ready_at(proven_height))
        else {
            debug!(%message_hash, "message is no longer ready for confirmation");
            return Ok(());
        };

        let data = self.confirm_call(&message, proven_height).await?;
        let receipt = self.submit(Action::Confirm(message_hash), data).await?;

        self.repositories
            .messages
            .save(Message {
                target_status: MessageStatus::Declared,
                ..message
            })
            .await
            .change_context(Error::Store)?;

        info!(
            %message_hash,
            message_type = %self.route.message_type,
            transaction_hash = %receipt.transaction_hash,
            "confirmed message"
        );

        Ok(())
    }

    async fn submit(&self, action: Action, data: Bytes) -> Result<chain::Receipt, Error> {
        let transaction_hash = match self.earlier_broadcast(action) {
            Some(transaction_hash) => {
                debug!(?action, %transaction_hash, "waiting for earlier broadcast");
                transaction_hash
            }
            None => {
                let transaction_hash = with_retry_if(
                    || self.account.submit(self.route.target_gateway, data.clone()),
                    self.retry_policy,
                    is_transient,
                )
                .await
                .change_context(Error::Chain)
                .attach_printable_lazy(|| format!("signer: {}", self.account.address()))?;

                self.broadcasts
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(action, transaction_hash);
                transaction_hash
            }
        };

        let receipt = with_retry_if(
            || self.target.wait_for_receipt(transaction_hash),
            self.retry_policy,
            is_transient,
        )
        .await;

        // an unmined transaction stays on record until it is mined or fails for good
        if !receipt.as_ref().is_err_and(is_transient) {
            self.broadcasts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&action);
        }

        receipt
            .change_context(Error::Chain)
            .attach_printable_lazy(|| format!("transaction: {transaction_hash}"))
    }

    fn earlier_broadcast(&self, action: Action) -> Option<Hash> {
        self.broadcasts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&action)
            .copied()
    }

    async fn storage_proof(&self, message_hash: Hash, block_number: u64) -> Result<Bytes, Error> {
        let key = outbox_storage_key(message_hash, self.route.outbox_storage_index);

        with_retry_if(
            || self.source.proof(self.route.source_gateway, vec![key], block_number),
            self.retry_policy,
            is_transient,
        )
        .await
        .change_context(Error::Chain)?
        .encoded_storage_proof(0)
        .ok_or(report!(chain::Error::InvalidResponse))
        .attach_printable_lazy(|| format!("no storage proof for key {key}"))
        .change_context(Error::Chain)
    }

    async fn confirm_call(&self, message: &Message, block_number: u64) -> Result<Bytes, Error> {
        let message_hash = message.message_hash;
        let (Some(fee_gas_price), Some(fee_gas_limit), Some(sender)) =
            (message.fee_gas_price, message.fee_gas_limit, message.sender)
        else {
            return Err(report!(Error::IncompleteMessage(message_hash)));
        };

        let data = match message.message_type {
            MessageType::Deposit => {
                let intent = self
                    .repositories
                    .deposit_intents
                    .get(message_hash)
                    .await
                    .change_context(Error::Store)?
                    .ok_or(report!(Error::MissingIntent(message_hash)))?;

                confirmDepositCall {
                    valueToken: intent.value_token,
                    amount: intent.amount,
                    beneficiary: intent.beneficiary,
                    feeGasPrice: fee_gas_price,
                    feeGasLimit: fee_gas_limit,
                    depositor: sender,
                    blockNumber: U256::from(block_number),
                    rlpParentNodes: self.storage_proof(message_hash, block_number).await?,
                }
                .abi_encode()
            }
            MessageType::Withdraw => {
                let intent = self
                    .repositories
                    .withdraw_intents
                    .get(message_hash)
                    .await
                    .change_context(Error::Store)?
                    .ok_or(report!(Error::MissingIntent(message_hash)))?;
                let pair = self
                    .repositories
                    .token_pairs
                    .find_by_utility_token(self.route.target_gateway, intent.utility_token)
                    .await
                    .change_context(Error::Store)?
                    .ok_or(report!(Error::MissingTokenPair(intent.utility_token)))?;

                confirmWithdrawCall {
                    utilityToken: intent.utility_token,
                    valueToken: pair.value_token,
                    amount: intent.amount,
                    beneficiary: intent.beneficiary,
                    feeGasPrice: fee_gas_price,
                    feeGasLimit: fee_gas_limit,
                    withdrawer: sender,
                    blockNumber: U256::from(block_number),
                    rlpParentNodes: self.storage_proof(message_hash, block_number).await?,
                }
                .abi_encode()
            }
        };

        Ok(data.into())
    }
}
