use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use error_stack::{ensure, Result, ResultExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{handle_concurrently, Error, EventHandler};
use crate::deserializers::deserialize_str_to_from_str;
use crate::repositories::Repositories;
use crate::types::{Hash, Message, MessageStatus, MessageType, WithdrawIntent};

/// Withdraw intent declared on the auxiliary chain co-gateway.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclaredWithdrawIntent {
    pub message_hash: Hash,
    pub contract_address: Address,
    pub utility_token: Address,
    #[serde(deserialize_with = "deserialize_str_to_from_str")]
    pub amount: U256,
    pub beneficiary: Address,
    #[serde(deserialize_with = "deserialize_str_to_from_str")]
    pub fee_gas_price: U256,
    #[serde(deserialize_with = "deserialize_str_to_from_str")]
    pub fee_gas_limit: U256,
    pub withdrawer: Address,
    pub withdraw_intent_hash: Hash,
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

    async fn handle_record(&self, record: DeclaredWithdrawIntent) -> Result<(), Error> {
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
                "ignoring withdraw intent from unknown gateway"
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
                    MessageType::Withdraw,
                    MessageStatus::Undeclared,
                    MessageStatus::Undeclared,
                    gateway.gateway_address,
                )
            });

        ensure!(
            message.message_type == MessageType::Withdraw,
            Error::TypeMismatch {
                hash: record.message_hash,
                stored: message.message_type,
                expected: MessageType::Withdraw,
            }
        );

        // the intent has to be stored before the message becomes pending
        self.repositories
            .withdraw_intents
            .save(WithdrawIntent {
                message_hash: record.message_hash,
                intent_hash: Some(record.withdraw_intent_hash),
                utility_token: record.utility_token,
                amount: record.amount,
                beneficiary: record.beneficiary,
                created_at: None,
                updated_at: None,
            })
            .await
            .change_context(Error::Store)?;

        if message.source_status != MessageStatus::Undeclared {
            debug!(message_hash = %record.message_hash, "withdraw already declared");
            return Ok(());
        }

        self.repositories
            .messages
            .save(Message {
                source_status: MessageStatus::Declared,
                intent_hash: Some(record.withdraw_intent_hash),
                fee_gas_price: Some(record.fee_gas_price),
                fee_gas_limit: Some(record.fee_gas_limit),
                sender: Some(record.withdrawer),
                source_declaration_block_number: Some(record.block_number),
                gateway_address: gateway.gateway_address,
                ..message
            })
            .await
            .change_context(Error::Store)?;

        info!(
            message_hash = %record.message_hash,
            block_number = record.block_number,
            "withdraw declared on auxiliary chain"
        );

        Ok(())
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn handle(&self, records: Vec<Value>) -> Result<(), Error> {
        handle_concurrently(records, |record: DeclaredWithdrawIntent| {
            self.handle_record(record)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::handlers::test_utils::{auxiliary_gateway, seeded_repositories};

    fn record(hash: Hash, contract_address: Address) -> Value {
        json!({
            "messageHash": hash,
            "contractAddress": contract_address,
            "utilityToken": Address::repeat_byte(0x33),
            "amount": "1000",
            "beneficiary": Address::repeat_byte(0x44),
            "feeGasPrice": "5",
            "feeGasLimit": "7",
            "withdrawer": Address::repeat_byte(0x55),
            "withdrawIntentHash": Hash::repeat_byte(0x66),
            "blockNumber": "100",
        })
    }

    #[tokio::test]
    async fn declares_source_side_and_stores_intent() {
        let repositories = seeded_repositories().await;
        let handler = Handler::new(repositories.clone());

        handler
            .handle(vec![record(Hash::repeat_byte(1), auxiliary_gateway())])
            .await
            .unwrap();

        let stored = repositories
            .messages
            .get(Hash::repeat_byte(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.message_type, MessageType::Withdraw);
        assert_eq!(stored.source_status, MessageStatus::Declared);
        assert_eq!(stored.target_status, MessageStatus::Undeclared);
        assert_eq!(stored.gateway_address, auxiliary_gateway());
        assert_eq!(stored.intent_hash, Some(Hash::repeat_byte(0x66)));
        assert_eq!(stored.fee_gas_price, Some(U256::from(5)));
        assert_eq!(stored.fee_gas_limit, Some(U256::from(7)));
        assert_eq!(stored.sender, Some(Address::repeat_byte(0x55)));
        assert_eq!(stored.source_declaration_block_number, Some(100));

        let intent = repositories
            .withdraw_intents
            .get(Hash::repeat_byte(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(intent.utility_token, Address::repeat_byte(0x33));
        assert_eq!(intent.amount, U256::from(1000));
        assert_eq!(intent.beneficiary, Address::repeat_byte(0x44));
    }

    #[tokio::test]
    async fn unknown_gateway_produces_no_writes() {
        let repositories = seeded_repositories().await;
        let handler = Handler::new(repositories.clone());

        handler
            .handle(vec![record(Hash::repeat_byte(1), Address::repeat_byte(0x99))])
            .await
            .unwrap();

        assert!(repositories
            .messages
            .get(Hash::repeat_byte(1))
            .await
            .unwrap()
            .is_none());
        assert!(repositories
            .withdraw_intents
            .get(Hash::repeat_byte(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn declaration_completes_a_shell_created_by_the_confirmation() {
        let repositories = seeded_repositories().await;
        repositories
            .messages
            .save(Message::new(
                Hash::repeat_byte(1),
                MessageType::Withdraw,
                MessageStatus::Undeclared,
                MessageStatus::Declared,
                auxiliary_gateway(),
            ))
            .await
            .unwrap();
        let handler = Handler::new(repositories.clone());

        handler
            .handle(vec![record(Hash::repeat_byte(1), auxiliary_gateway())])
            .await
            .unwrap();

        let stored = repositories
            .messages
            .get(Hash::repeat_byte(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.source_status, MessageStatus::Declared);
        assert_eq!(stored.target_status, MessageStatus::Declared);
        assert_eq!(stored.sender, Some(Address::repeat_byte(0x55)));
    }

    #[tokio::test]
    async fn withdraw_record_for_a_deposit_message_is_rejected() {
        let repositories = seeded_repositories().await;
        repositories
            .messages
            .save(Message::new(
                Hash::repeat_byte(1),
                MessageType::Deposit,
                MessageStatus::Undeclared,
                MessageStatus::Undeclared,
                auxiliary_gateway(),
            ))
            .await
            .unwrap();
        let handler = Handler::new(repositories.clone());

        let result = handler
            .handle(vec![record(Hash::repeat_byte(1), auxiliary_gateway())])
            .await;

        assert!(matches!(
            result.unwrap_err().current_context(),
            Error::TypeMismatch { .. }
        ));
        assert!(repositories
            .withdraw_intents
            .get(Hash::repeat_byte(1))
            .await
            .unwrap()
            .is_none());
    }
}
