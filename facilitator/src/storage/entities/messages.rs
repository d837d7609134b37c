use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "messages")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub message_hash: String,
    pub message_type: String,
    pub source_status: String,
    pub target_status: String,
    pub gateway_address: String,
    pub intent_hash: Option<String>,
    pub fee_gas_price: Option<String>,
    pub fee_gas_limit: Option<String>,
    pub source_declaration_block_number: Option<i64>,
    pub sender: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
