use chrono::Utc;
use error_stack::{Result, ResultExt};
use sea_orm::sea_query::OnConflict;
use sea_orm::ActiveValue::Set;
use sea_orm::{DatabaseConnection, EntityTrait};

use super::{decode, decode_optional, encode_address, Error};
use crate::storage::entities::{deposit_intents, withdraw_intents};
use crate::types::{DepositIntent, Hash, WithdrawIntent};

pub struct DepositIntentRepository {
    db: DatabaseConnection,
}

impl DepositIntentRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn get(&self, message_hash: Hash) -> Result<Option<DepositIntent>, Error> {
        deposit_intents::Entity::find_by_id(message_hash.to_string())
            .one(&self.db)
            .await
            .change_context(Error::Database)?
            .map(DepositIntent::try_from)
            .transpose()
    }

    /// Inserts the intent or overwrites its payload, keeping the original creation time.
    pub async fn save(&self, intent: DepositIntent) -> Result<(), Error> {
        let now = Utc::now();

        deposit_intents::Entity::insert(deposit_intents::ActiveModel {
            message_hash: Set(intent.message_hash.to_string()),
            intent_hash: Set(intent.intent_hash.map(|hash| hash.to_string())),
            value_token: Set(encode_address(&intent.value_token)),
            amount: Set(intent.amount.to_string()),
            beneficiary: Set(encode_address(&intent.beneficiary)),
            created_at: Set(now),
            updated_at: Set(now),
        })
        .on_conflict(
            OnConflict::column(deposit_intents::Column::MessageHash)
                .update_columns([
                    deposit_intents::Column::IntentHash,
                    deposit_intents::Column::ValueToken,
                    deposit_intents::Column::Amount,
                    deposit_intents::Column::Beneficiary,
                    deposit_intents::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec(&self.db)
        .await
        .change_context(Error::Database)?;

        Ok(())
    }
}

impl TryFrom<deposit_intents::Model> for DepositIntent {
    type Error = error_stack::Report<Error>;

    fn try_from(model: deposit_intents::Model) -> std::result::Result<Self, Self::Error> {
        Ok(DepositIntent {
            message_hash: decode("message hash", &model.message_hash)?,
            intent_hash: decode_optional("intent hash", model.intent_hash.as_deref())?,
            value_token: decode("value token", &model.value_token)?,
            amount: decode("amount", &model.amount)?,
            beneficiary: decode("beneficiary", &model.beneficiary)?,
            created_at: Some(model.created_at),
            updated_at: Some(model.updated_at),
        })
    }
}

pub struct WithdrawIntentRepository {
    db: DatabaseConnection,
}

impl WithdrawIntentRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn get(&self, message_hash: Hash) -> Result<Option<WithdrawIntent>, Error> {
        withdraw_intents::Entity::find_by_id(message_hash.to_string())
            .one(&self.db)
            .await
            .change_context(Error::Database)?
            .map(WithdrawIntent::try_from)
            .transpose()
    }

    pub async fn save(&self, intent: WithdrawIntent) -> Result<(), Error> {
        let now = Utc::now();

        withdraw_intents::Entity::insert(withdraw_intents::ActiveModel {
            message_hash: Set(intent.message_hash.to_string()),
            intent_hash: Set(intent.intent_hash.map(|hash| hash.to_string())),
            utility_token: Set(encode_address(&intent.utility_token)),
            amount: Set(intent.amount.to_string()),
            beneficiary: Set(encode_address(&intent.beneficiary)),
            created_at: Set(now),
            updated_at: Set(now),
        })
        .on_conflict(
            OnConflict::column(withdraw_intents::Column::MessageHash)
                .update_columns([
                    withdraw_intents::Column::IntentHash,
                    withdraw_intents::Column::UtilityToken,
                    withdraw_intents::Column::Amount,
                    withdraw_intents::Column::Beneficiary,
                    withdraw_intents::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec(&self.db)
        .await
        .change_context(Error::Database)?;

        Ok(())
    }
}

impl TryFrom<withdraw_intents::Model> for WithdrawIntent {
    type Error = error_stack::Report<Error>;

    fn try_from(model: withdraw_intents::Model) -> std::result::Result<Self, Self::Error> {
        Ok(WithdrawIntent {
            message_hash: decode("message hash", &model.message_hash)?,
            intent_hash: decode_optional("intent hash", model.intent_hash.as_deref())?,
            utility_token: decode("utility token", &model.utility_token)?,
            amount: decode("amount", &model.amount)?,
            beneficiary: decode("beneficiary", &model.beneficiary)?,
            created_at: Some(model.created_at),
            updated_at: Some(model.updated_at),
        })
    }
}
