use alloy_primitives::Address;
use chrono::Utc;
use error_stack::{ensure, Result, ResultExt};
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    TransactionTrait,
};
use tracing::debug;

use super::{
    decode, decode_block_number, decode_optional, encode_address, encode_block_number, Error,
};
use crate::asyncutil::keyed_lock::KeyedLock;
use crate::observer::Subject;
use crate::storage::entities::messages;
use crate::types::{Hash, Message, MessageStatus, MessageType};

/// Store of [Message] records. Every successful save is announced to the observers attached to [Self::subject].
pub struct MessageRepository {
    db: DatabaseConnection,
    locks: KeyedLock<Hash>,
    subject: Subject<Message>,
}

impl MessageRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            locks: KeyedLock::new(),
            subject: Subject::new(),
        }
    }

    pub fn subject(&self) -> &Subject<Message> {
        &self.subject
    }

    pub async fn get(&self, message_hash: Hash) -> Result<Option<Message>, Error> {
        messages::Entity::find_by_id(message_hash.to_string())
            .one(&self.db)
            .await
            .change_context(Error::Database)?
            .map(Message::try_from)
            .transpose()
    }

    /// Inserts the message, or merges the supplied fields into the stored record.
    ///
    /// Statuses never move back to `Undeclared`, optional fields that are `None` keep their stored value,
    /// and the message type can not change.
    pub async fn save(&self, message: Message) -> Result<Message, Error> {
        let saved = {
            let _guard = self.locks.lock(message.message_hash).await;
            self.upsert(message).await?
        };

        self.subject.notify(&saved).await;

        Ok(saved)
    }

    /// Messages declared on the source chain at or below `max_block_height` that still wait for the target chain.
    pub async fn list_pending(
        &self,
        gateway_address: Address,
        message_type: MessageType,
        max_block_height: u64,
    ) -> Result<Vec<Message>, Error> {
        messages::Entity::find()
            .filter(messages::Column::GatewayAddress.eq(encode_address(&gateway_address)))
            .filter(messages::Column::MessageType.eq(message_type.to_string()))
            .filter(messages::Column::SourceStatus.eq(MessageStatus::Declared.to_string()))
            .filter(messages::Column::TargetStatus.eq(MessageStatus::Undeclared.to_string()))
            .filter(
                messages::Column::SourceDeclarationBlockNumber
                    .lte(encode_block_number(max_block_height)?),
            )
            .order_by_asc(messages::Column::SourceDeclarationBlockNumber)
            .all(&self.db)
            .await
            .change_context(Error::Database)?
            .into_iter()
            .map(Message::try_from)
            .collect()
    }

    async fn upsert(&self, message: Message) -> Result<Message, Error> {
        let txn = self.db.begin().await.change_context(Error::Database)?;
        let now = Utc::now();

        let stored = messages::Entity::find_by_id(message.message_hash.to_string())
            .one(&txn)
            .await
            .change_context(Error::Database)?;

        let model = match stored {
            None => {
                debug!(message_hash = %message.message_hash, "inserting new message");

                messages::ActiveModel {
                    message_hash: Set(message.message_hash.to_string()),
                    message_type: Set(message.message_type.to_string()),
                    source_status: Set(message.source_status.to_string()),
                    target_status: Set(message.target_status.to_string()),
                    gateway_address: Set(encode_address(&message.gateway_address)),
                    intent_hash: Set(message.intent_hash.map(|hash| hash.to_string())),
                    fee_gas_price: Set(message.fee_gas_price.map(|fee| fee.to_string())),
                    fee_gas_limit: Set(message.fee_gas_limit.map(|fee| fee.to_string())),
                    source_declaration_block_number: Set(message
                        .source_declaration_block_number
                        .map(encode_block_number)
                        .transpose()?),
                    sender: Set(message.sender.as_ref().map(encode_address)),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await
                .change_context(Error::Database)?
            }
            Some(stored) => {
                let current = Message::try_from(stored.clone())?;
                ensure!(
                    current.message_type == message.message_type,
                    Error::TypeMismatch {
                        hash: message.message_hash,
                        stored: current.message_type,
                        requested: message.message_type,
                    }
                );

                let updated_at = now.max(stored.updated_at);
                let mut active: messages::ActiveModel = stored.into();

                active.source_status =
                    Set(current.source_status.max(message.source_status).to_string());
                active.target_status =
                    Set(current.target_status.max(message.target_status).to_string());
                active.gateway_address = Set(encode_address(&message.gateway_address));
                if let Some(intent_hash) = message.intent_hash {
                    active.intent_hash = Set(Some(intent_hash.to_string()));
                }
                if let Some(fee_gas_price) = message.fee_gas_price {
                    active.fee_gas_price = Set(Some(fee_gas_price.to_string()));
                }
                if let Some(fee_gas_limit) = message.fee_gas_limit {
                    active.fee_gas_limit = Set(Some(fee_gas_limit.to_string()));
                }
                if let Some(block_number) = message.source_declaration_block_number {
                    active.source_declaration_block_number =
                        Set(Some(encode_block_number(block_number)?));
                }
                if let Some(sender) = message.sender {
                    active.sender = Set(Some(encode_address(&sender)));
                }
                active.updated_at = Set(updated_at);

                active.update(&txn).await.change_context(Error::Database)?
            }
        };

        txn.commit().await.change_context(Error::Database)?;

        Message::try_from(model)
    }
}

impl TryFrom<messages::Model> for Message {
    type Error = error_stack::Report<Error>;

    fn try_from(model: messages::Model) -> std::result::Result<Self, Self::Error> {
        Ok(Message {
            message_hash: decode("message hash", &model.message_hash)?,
            message_type: decode("message type", &model.message_type)?,
            source_status: decode("source status", &model.source_status)?,
            target_status: decode("target status", &model.target_status)?,
            gateway_address: decode("gateway address", &model.gateway_address)?,
            intent_hash: decode_optional("intent hash", model.intent_hash.as_deref())?,
            fee_gas_price: decode_optional("fee gas price", model.fee_gas_price.as_deref())?,
            fee_gas_limit: decode_optional("fee gas limit", model.fee_gas_limit.as_deref())?,
            source_declaration_block_number: model
                .source_declaration_block_number
                .map(decode_block_number)
                .transpose()?,
            sender: decode_optional("sender", model.sender.as_deref())?,
            created_at: Some(model.created_at),
            updated_at: Some(model.updated_at),
        })
    }
}
