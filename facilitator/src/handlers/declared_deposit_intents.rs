use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use error_stack::{ensure, Result, ResultExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{handle_concurrently, Error, EventHandler};
use crate::deserializers::deserialize_str_to_from_str;
use crate::repositories::Repositories;
use crate::types::{DepositIntent, Hash, Message, MessageStatus, MessageType};

/// Deposit intent declared on the origin chain gateway.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclaredDepositIntent {
    pub message_hash: Hash,
    pub contract_address: Address,
    pub value_token: Address,
    #[serde(deserialize_with = "deserialize_str_to_from_str")]
    pub amount: U256,
    pub beneficiary: Address,
    #[serde(deserialize_with = "deserialize_str_to_from_str")]
    pub fee_gas_price: U256,
    #[serde(deserialize_with = "deserialize_str_to_from_str")]
    pub fee_gas_limit: U256,
    pub depositor: Address,
    pub deposit_intent_hash: Hash,
    #[serde(deserialize_with = "deserialize_str_to_from_str")]
    pub block_number: u64,
}

pub struct Handler {
    repositories: Repositories,
}

impl Handler {
    pub fn new(repositories: Repositories) -> Self {
        Self { repositories }
    }

    async fn handle_record(&self, record: DeclaredDepositIntent) -> Result<(), Error> {
        let Some(gateway) = self
            .repositories
            .gateways
            .get(record.contract_address)
            .await
            .change_context(Error::Store)?
        else {
            debug!(
                contract_address = %record.contract_address,
                message_hash = %record.message_hash,
                "ignoring deposit intent from unknown gateway"
            );
            return Ok(());
        };

        let message = self
            .repositories
            .messages
            .get(record.message_hash)
            .await
            .change_context(Error::Store)?
            .unwrap_or_else(|| {
                Message::new(
                    record.message_hash,
                    MessageType::Deposit,
                    MessageStatus::Undeclared,
                    MessageStatus::Undeclared,
                    gateway.gateway_address,
                )
            });

        ensure!(
            message.message_type == MessageType::Deposit,
            Error::TypeMismatch {
                hash: record.message_hash,
                stored: message.message_type,
                expected: MessageType::Deposit,
            }
        );

        // the intent has to be stored before the message becomes pending
        self.repositories
            .deposit_intents
            .save(DepositIntent {
                message_hash: record.message_hash,
                intent_hash: Some(record.deposit_intent_hash),
                value_token: record.value_token,
                amount: record.amount,
                beneficiary: record.beneficiary,
                created_at: None,
                updated_at: None,
            })
            .await
            .change_context(Error::Store)?;

        if message.source_status != MessageStatus::Undeclared {
            debug!(message_hash = %record.message_hash, "deposit already declared");
            return Ok(());
        }

        self.repositories
            .messages
            .save(Message {
                source_status: MessageStatus::Declared,
                intent_hash: Some(record.deposit_intent_hash),
                fee_gas_price: Some(record.fee_gas_price),
                fee_gas_limit: Some(record.fee_gas_limit),
                sender: Some(record.depositor),
                source_declaration_block_number: Some(record.block_number),
                gateway_address: gateway.gateway_address,
                ..message
            })
            .await
            .change_context(Error::Store)?;

        info!(
            message_hash = %record.message_hash,
            block_number = record.block_number,
            "deposit declared on origin chain"
        );

        Ok(())
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn handle(&self, records: Vec<Value>) -> Result<(), Error> {
        handle_concurrently(records, |record: DeclaredDepositIntent| {
            self.handle_record(record)
        })
        .await
    }
}
