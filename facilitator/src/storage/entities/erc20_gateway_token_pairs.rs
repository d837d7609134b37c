use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "erc20_gateway_token_pairs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub gateway_address: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub value_token: String,
    pub utility_token: String,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
