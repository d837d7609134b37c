//! Idempotent reducers turning decoded contract events into message store writes.
//!
//! Every handler skips records emitted by contracts that are not registered gateways, and only
//! advances a status that is still in its predecessor state, so redelivered or reordered records are
//! harmless.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::{report, Frame, Report, Result, ResultExt};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::event_sub::{EntityKind, FeedUpdate};
use crate::report::collect_errors;
use crate::repositories::Repositories;
use crate::types::{Hash, MessageType};

pub mod confirmed_intents;
pub mod created_utility_tokens;
pub mod declared_deposit_intents;
pub mod declared_withdraw_intents;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed event record")]
    MalformedRecord,
    #[error("failed to access the message store")]
    Store,
    #[error("message {hash} is a {stored} message but the event belongs to a {expected} message")]
    TypeMismatch {
        hash: Hash,
        stored: MessageType,
        expected: MessageType,
    },
    #[error("no handler registered for {0}")]
    UnregisteredEntity(EntityKind),
}

impl Error {
    /// True if any record failed for a reason that handling it again can fix.
    pub fn is_retryable(report: &Report<Error>) -> bool {
        report
            .frames()
            .filter_map(Frame::downcast_ref::<Error>)
            .any(|err| matches!(err, Error::Store))
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, records: Vec<Value>) -> Result<(), Error>;
}

/// Decodes and handles all records concurrently. Every record is processed even if others fail, the
/// failures are reported together at the end.
async fn handle_concurrently<R, F, Fut>(records: Vec<Value>, handle_record: F) -> Result<(), Error>
where
    R: DeserializeOwned,
    F: Fn(R) -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    let handle_record = &handle_record;

    let results = join_all(records.into_iter().map(|record| async move {
        let decoded = R::deserialize(&record)
            .change_context(Error::MalformedRecord)
            .attach_printable_lazy(|| record.to_string())?;

        handle_record(decoded).await
    }))
    .await;

    collect_errors(results)
}

/// Routes feed updates to the handler responsible for their entity kind.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EntityKind, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new(repositories: &Repositories) -> Self {
        Self::default()
            .register(
                EntityKind::DeclaredDepositIntents,
                declared_deposit_intents::Handler::new(repositories.clone()),
            )
            .register(
                EntityKind::ConfirmedDepositIntents,
                confirmed_intents::Handler::new(MessageType::Deposit, repositories.clone()),
            )
            .register(
                EntityKind::DeclaredWithdrawIntents,
                declared_withdraw_intents::Handler::new(repositories.clone()),
            )
            .register(
                EntityKind::ConfirmedWithdrawIntents,
                confirmed_intents::Handler::new(MessageType::Withdraw, repositories.clone()),
            )
            .register(
                EntityKind::CreatedUtilityTokens,
                created_utility_tokens::Handler::new(repositories.clone()),
            )
    }

    pub fn register(mut self, entity: EntityKind, handler: impl EventHandler + 'static) -> Self {
        self.handlers.insert(entity, Arc::new(handler));
        self
    }

    pub async fn dispatch(&self, update: FeedUpdate) -> Result<(), Error> {
        let handler = self
            .handlers
            .get(&update.entity)
            .ok_or(report!(Error::UnregisteredEntity(update.entity)))?;

        handler
            .handle(update.records)
            .await
            .attach_printable_lazy(|| format!("entity: {}", update.entity))
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use alloy_primitives::Address;

    use crate::repositories::Repositories;
    use crate::types::{Chain, Gateway};

    pub const ORIGIN_GATEWAY: [u8; 20] = [0x0a; 20];
    pub const AUXILIARY_GATEWAY: [u8; 20] = [0x0b; 20];

    pub fn origin_gateway() -> Address {
        Address::from(ORIGIN_GATEWAY)
    }

    pub fn auxiliary_gateway() -> Address {
        Address::from(AUXILIARY_GATEWAY)
    }

    /// Repositories with the origin gateway and its auxiliary co-gateway registered.
    pub async fn seeded_repositories() -> Repositories {
        let repositories = crate::repositories::in_memory().await;

        repositories
            .gateways
            .save(Gateway::new(
                origin_gateway(),
                auxiliary_gateway(),
                Chain::Origin,
                Address::repeat_byte(0x1a),
            ))
            .await
            .unwrap();
        repositories
            .gateways
            .save(Gateway::new(
                auxiliary_gateway(),
                origin_gateway(),
                Chain::Auxiliary,
                Address::repeat_byte(0x1b),
            ))
            .await
            .unwrap();

        repositories
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::test_utils::*;
    use super::*;
    use crate::types::{Message, MessageStatus};

    fn declared_deposit_record(hash: Hash) -> Value {
        json!({
            "messageHash": hash,
            "contractAddress": origin_gateway(),
            "valueToken": alloy_primitives::Address::repeat_byte(0x33),
            "amount": "1000",
            "beneficiary": alloy_primitives::Address::repeat_byte(0x44),
            "feeGasPrice": "1",
            "feeGasLimit": "2",
            "depositor": alloy_primitives::Address::repeat_byte(0x55),
            "depositIntentHash": Hash::repeat_byte(0x66),
            "blockNumber": "100",
        })
    }

    fn confirmed_deposit_record(hash: Hash) -> Value {
        json!({
            "messageHash": hash,
            "contractAddress": auxiliary_gateway(),
        })
    }

    #[tokio::test]
    async fn out_of_order_delivery_converges_to_both_sides_declared() {
        let repositories = seeded_repositories().await;
        let registry = HandlerRegistry::new(&repositories);
        let hash = Hash::repeat_byte(1);

        // target side first, then the source side
        registry
            .dispatch(FeedUpdate {
                entity: EntityKind::ConfirmedDepositIntents,
                records: vec![confirmed_deposit_record(hash)],
                position: 1,
            })
            .await
            .unwrap();
        registry
            .dispatch(FeedUpdate {
                entity: EntityKind::DeclaredDepositIntents,
                records: vec![declared_deposit_record(hash)],
                position: 2,
            })
            .await
            .unwrap();

        let stored = repositories.messages.get(hash).await.unwrap().unwrap();
        assert_eq!(stored.source_status, MessageStatus::Declared);
        assert_eq!(stored.target_status, MessageStatus::Declared);
        assert_eq!(stored.gateway_address, origin_gateway());
        assert_eq!(stored.source_declaration_block_number, Some(100));
        assert!(repositories
            .messages
            .list_pending(origin_gateway(), MessageType::Deposit, u64::from(u32::MAX))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn one_malformed_record_does_not_abort_the_batch() {
        let repositories = seeded_repositories().await;
        let registry = HandlerRegistry::new(&repositories);

        let result = registry
            .dispatch(FeedUpdate {
                entity: EntityKind::DeclaredDepositIntents,
                records: vec![
                    json!({ "messageHash": "not a hash" }),
                    declared_deposit_record(Hash::repeat_byte(2)),
                    declared_deposit_record(Hash::repeat_byte(3)),
                ],
                position: 3,
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.current_frames().len(), 1);
        assert!(matches!(err.current_context(), Error::MalformedRecord));
        assert!(!Error::is_retryable(&err));

        for hash in [Hash::repeat_byte(2), Hash::repeat_byte(3)] {
            let stored: Message = repositories.messages.get(hash).await.unwrap().unwrap();
            assert_eq!(stored.source_status, MessageStatus::Declared);
        }
    }

    #[tokio::test]
    async fn unregistered_entities_are_reported() {
        let repositories = seeded_repositories().await;
        let registry = HandlerRegistry::default().register(
            EntityKind::CreatedUtilityTokens,
            created_utility_tokens::Handler::new(repositories),
        );

        let result = registry
            .dispatch(FeedUpdate {
                entity: EntityKind::DeclaredDepositIntents,
                records: vec![],
                position: 4,
            })
            .await;

        assert!(matches!(
            result.unwrap_err().current_context(),
            Error::UnregisteredEntity(EntityKind::DeclaredDepositIntents)
        ));
    }

    #[test]
    fn batches_with_store_failures_are_retryable() {
        let mut err = report!(Error::MalformedRecord);
        err.extend_one(report!(Error::Store).attach_printable("connection reset"));

        assert!(Error::is_retryable(&err));
        assert!(!Error::is_retryable(&report!(Error::TypeMismatch {
            hash: Hash::repeat_byte(1),
            stored: MessageType::Withdraw,
            expected: MessageType::Deposit,
        })));
    }
}
