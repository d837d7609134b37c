use alloy_primitives::Address;
use chrono::Utc;
use error_stack::{Result, ResultExt};
use sea_orm::sea_query::OnConflict;
use sea_orm::ActiveValue::Set;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};

use super::{decode, encode_address, Error};
use crate::storage::entities::erc20_gateway_token_pairs;
use crate::types::Erc20GatewayTokenPair;

pub struct Erc20GatewayTokenPairRepository {
    db: DatabaseConnection,
}

impl Erc20GatewayTokenPairRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn get(
        &self,
        gateway_address: Address,
        value_token: Address,
    ) -> Result<Option<Erc20GatewayTokenPair>, Error> {
        erc20_gateway_token_pairs::Entity::find_by_id((
            encode_address(&gateway_address),
            encode_address(&value_token),
        ))
        .one(&self.db)
        .await
        .change_context(Error::Database)?
        .map(Erc20GatewayTokenPair::try_from)
        .transpose()
    }

    pub async fn find_by_utility_token(
        &self,
        gateway_address: Address,
        utility_token: Address,
    ) -> Result<Option<Erc20GatewayTokenPair>, Error> {
        erc20_gateway_token_pairs::Entity::find()
            .filter(
                erc20_gateway_token_pairs::Column::GatewayAddress
                    .eq(encode_address(&gateway_address)),
            )
            .filter(
                erc20_gateway_token_pairs::Column::UtilityToken.eq(encode_address(&utility_token)),
            )
            .one(&self.db)
            .await
            .change_context(Error::Database)?
            .map(Erc20GatewayTokenPair::try_from)
            .transpose()
    }

    /// Stores the pair unless one already exists for the gateway and value token.
    /// Returns whether a new pair was stored.
    pub async fn save_if_absent(&self, pair: Erc20GatewayTokenPair) -> Result<bool, Error> {
        let inserted = erc20_gateway_token_pairs::Entity::insert(
            erc20_gateway_token_pairs::ActiveModel {
                gateway_address: Set(encode_address(&pair.gateway_address)),
                value_token: Set(encode_address(&pair.value_token)),
                utility_token: Set(encode_address(&pair.utility_token)),
                created_at: Set(Utc::now()),
            },
        )
        .on_conflict(
            OnConflict::columns([
                erc20_gateway_token_pairs::Column::GatewayAddress,
                erc20_gateway_token_pairs::Column::ValueToken,
            ])
            .do_nothing()
            .to_owned(),
        )
        .exec_without_returning(&self.db)
        .await
        .change_context(Error::Database)?;

        Ok(inserted > 0)
    }
}

impl TryFrom<erc20_gateway_token_pairs::Model> for Erc20GatewayTokenPair {
    type Error = error_stack::Report<Error>;

    fn try_from(
        model: erc20_gateway_token_pairs::Model,
    ) -> std::result::Result<Self, Self::Error> {
        Ok(Erc20GatewayTokenPair {
            gateway_address: decode("gateway address", &model.gateway_address)?,
            value_token: decode("value token", &model.value_token)?,
            utility_token: decode("utility token", &model.utility_token)?,
            created_at: Some(model.created_at),
        })
    }
}
