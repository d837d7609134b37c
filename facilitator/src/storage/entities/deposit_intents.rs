use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "deposit_intents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub message_hash: String,
    pub intent_hash: Option<String>,
    pub value_token: String,
    pub amount: String,
    pub beneficiary: String,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
