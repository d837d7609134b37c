use alloy_primitives::Address;
use chrono::Utc;
use error_stack::{report, Result, ResultExt};
use sea_orm::ActiveValue::Set;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, TransactionTrait};

use super::{decode, decode_block_number, encode_address, encode_block_number, Error};
use crate::storage::entities::gateways;
use crate::types::Gateway;

pub struct GatewayRepository {
    db: DatabaseConnection,
}

impl GatewayRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn get(&self, gateway_address: Address) -> Result<Option<Gateway>, Error> {
        gateways::Entity::find_by_id(encode_address(&gateway_address))
            .one(&self.db)
            .await
            .change_context(Error::Database)?
            .map(Gateway::try_from)
            .transpose()
    }

    /// Registers the gateway or refreshes its configuration. A known last proven block number is only
    /// replaced by a higher one.
    pub async fn save(&self, gateway: Gateway) -> Result<Gateway, Error> {
        let txn = self.db.begin().await.change_context(Error::Database)?;
        let now = Utc::now();

        let stored = gateways::Entity::find_by_id(encode_address(&gateway.gateway_address))
            .one(&txn)
            .await
            .change_context(Error::Database)?;

        let model = match stored {
            None => gateways::ActiveModel {
                gateway_address: Set(encode_address(&gateway.gateway_address)),
                remote_gateway_address: Set(encode_address(&gateway.remote_gateway_address)),
                chain: Set(gateway.chain.to_string()),
                anchor_address: Set(encode_address(&gateway.anchor_address)),
                remote_gateway_last_proven_block_number: Set(gateway
                    .remote_gateway_last_proven_block_number
                    .map(encode_block_number)
                    .transpose()?),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await
            .change_context(Error::Database)?,
            Some(stored) => {
                let last_proven = stored
                    .remote_gateway_last_proven_block_number
                    .map(decode_block_number)
                    .transpose()?
                    .max(gateway.remote_gateway_last_proven_block_number);
                let updated_at = now.max(stored.updated_at);

                let mut active: gateways::ActiveModel = stored.into();
                active.remote_gateway_address = Set(encode_address(&gateway.remote_gateway_address));
                active.chain = Set(gateway.chain.to_string());
                active.anchor_address = Set(encode_address(&gateway.anchor_address));
                active.remote_gateway_last_proven_block_number =
                    Set(last_proven.map(encode_block_number).transpose()?);
                active.updated_at = Set(updated_at);

                active.update(&txn).await.change_context(Error::Database)?
            }
        };

        txn.commit().await.change_context(Error::Database)?;

        Gateway::try_from(model)
    }

    /// Records that the remote gateway has been proven to `gateway_address` at `block_number`.
    pub async fn set_last_proven_block_number(
        &self,
        gateway_address: Address,
        block_number: u64,
    ) -> Result<Gateway, Error> {
        let gateway = self
            .get(gateway_address)
            .await?
            .ok_or(report!(Error::UnknownGateway(gateway_address)))?;

        self.save(Gateway {
            remote_gateway_last_proven_block_number: Some(block_number),
            ..gateway
        })
        .await
    }
}

impl TryFrom<gateways::Model> for Gateway {
    type Error = error_stack::Report<Error>;

    fn try_from(model: gateways::Model) -> std::result::Result<Self, Self::Error> {
        Ok(Gateway {
            gateway_address: decode("gateway address", &model.gateway_address)?,
            remote_gateway_address: decode("remote gateway address", &model.remote_gateway_address)?,
            chain: decode("chain", &model.chain)?,
            anchor_address: decode("anchor address", &model.anchor_address)?,
            remote_gateway_last_proven_block_number: model
                .remote_gateway_last_proven_block_number
                .map(decode_block_number)
                .transpose()?,
            created_at: Some(model.created_at),
            updated_at: Some(model.updated_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;
    use crate::types::Chain;

    fn gateway() -> Gateway {
        Gateway::new(
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            Chain::Origin,
            Address::repeat_byte(3),
        )
    }

    #[tokio::test]
    async fn saved_gateways_can_be_found_by_address() {
        let repository = GatewayRepository::new(storage::in_memory().await);

        let saved = repository.save(gateway()).await.unwrap();

        assert_eq!(
            repository.get(Address::repeat_byte(1)).await.unwrap(),
            Some(saved)
        );
        assert_eq!(repository.get(Address::repeat_byte(2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reseeding_keeps_the_last_proven_block_number() {
        let repository = GatewayRepository::new(storage::in_memory().await);
        repository.save(gateway()).await.unwrap();
        repository
            .set_last_proven_block_number(Address::repeat_byte(1), 50)
            .await
            .unwrap();

        let reseeded = repository.save(gateway()).await.unwrap();
        assert_eq!(reseeded.remote_gateway_last_proven_block_number, Some(50));

        let lowered = repository
            .set_last_proven_block_number(Address::repeat_byte(1), 40)
            .await
            .unwrap();
        assert_eq!(lowered.remote_gateway_last_proven_block_number, Some(50));
    }

    #[tokio::test]
    async fn proving_an_unknown_gateway_fails() {
        let repository = GatewayRepository::new(storage::in_memory().await);

        let result = repository
            .set_last_proven_block_number(Address::repeat_byte(1), 50)
            .await;

        assert!(matches!(
            result.unwrap_err().current_context(),
            Error::UnknownGateway(_)
        ));
    }
}
