use alloy_primitives::Address;
use async_trait::async_trait;
use error_stack::{ensure, Result, ResultExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{handle_concurrently, Error, EventHandler};
use crate::repositories::Repositories;
use crate::types::{Hash, Message, MessageStatus, MessageType};

/// Intent confirmation on the target chain. Emitted by the gateway that received the message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedIntent {
    pub message_hash: Hash,
    pub contract_address: Address,
}

/// Declares the target side of deposit or withdraw messages.
pub struct Handler {
    message_type: MessageType,
    repositories: Repositories,
}

impl Handler {
    pub fn new(message_type: MessageType, repositories: Repositories) -> Self {
        Self {
            message_type,
            repositories,
        }
    }

    async fn handle_record(&self, record: ConfirmedIntent) -> Result<(), Error> {
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
                "ignoring confirmation from unknown gateway"
            );
            return Ok(());
        };

        // the message might not have been seen on the source chain yet, the shell is filled in later
        let message = self
            .repositories
            .messages
            .get(record.message_hash)
            .await
            .change_context(Error::Store)?
            .unwrap_or_else(|| {
                Message::new(
                    record.message_hash,
                    self.message_type,
                    MessageStatus::Undeclared,
                    MessageStatus::Undeclared,
                    gateway.remote_gateway_address,
                )
            });

        if message.target_status != MessageStatus::Undeclared {
            debug!(message_hash = %record.message_hash, "message already declared on target chain");
            return Ok(());
        }

        ensure!(
            message.message_type == self.message_type,
            Error::TypeMismatch {
                hash: record.message_hash,
                stored: message.message_type,
                expected: self.message_type,
            }
        );

        self.repositories
            .messages
            .save(Message {
                target_status: MessageStatus::Declared,
                ..message
            })
            .await
            .change_context(Error::Store)?;

        info!(
            message_hash = %record.message_hash,
            message_type = %self.message_type,
            "message declared on target chain"
        );

        Ok(())
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn handle(&self, records: Vec<Value>) -> Result<(), Error> {
        handle_concurrently(records, |record: ConfirmedIntent| self.handle_record(record)).await
    }
}
