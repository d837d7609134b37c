use std::str::FromStr;
use std::sync::Arc;

use alloy_primitives::Address;
use error_stack::{Report, Result, ResultExt};
use sea_orm::DatabaseConnection;
use thiserror::Error;

use crate::types::{Hash, MessageType};

mod gateway;
mod intent;
mod message;
mod token_pair;

pub use gateway::GatewayRepository;
pub use intent::{DepositIntentRepository, WithdrawIntentRepository};
pub use message::MessageRepository;
pub use token_pair::Erc20GatewayTokenPairRepository;

#[derive(Error, Debug)]
pub enum Error {
    #[error("database operation failed")]
    Database,
    #[error("stored {0} is invalid")]
    InvalidData(&'static str),
    #[error("message {hash} is stored as {stored} and cannot be saved as {requested}")]
    TypeMismatch {
        hash: Hash,
        stored: MessageType,
        requested: MessageType,
    },
    #[error("gateway {0} is not registered")]
    UnknownGateway(Address),
}

/// All repositories of one database, shared by handlers and executors.
#[derive(Clone)]
pub struct Repositories {
    pub messages: Arc<MessageRepository>,
    pub gateways: Arc<GatewayRepository>,
    pub deposit_intents: Arc<DepositIntentRepository>,
    pub withdraw_intents: Arc<WithdrawIntentRepository>,
    pub token_pairs: Arc<Erc20GatewayTokenPairRepository>,
}

impl Repositories {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            messages: Arc::new(MessageRepository::new(db.clone())),
            gateways: Arc::new(GatewayRepository::new(db.clone())),
            deposit_intents: Arc::new(DepositIntentRepository::new(db.clone())),
            withdraw_intents: Arc::new(WithdrawIntentRepository::new(db.clone())),
            token_pairs: Arc::new(Erc20GatewayTokenPairRepository::new(db)),
        }
    }
}

fn encode_address(address: &Address) -> String {
    address.to_checksum(None)
}

fn encode_block_number(block_number: u64) -> Result<i64, Error> {
    i64::try_from(block_number)
        .change_context(Error::InvalidData("block number"))
        .attach_printable(block_number)
}

fn decode_block_number(block_number: i64) -> Result<u64, Error> {
    u64::try_from(block_number)
        .change_context(Error::InvalidData("block number"))
        .attach_printable(block_number)
}

/// Parses a column back into its domain type, naming the field in the error.
fn decode<T>(field: &'static str, value: &str) -> Result<T, Error>
where
    T: FromStr,
    T::Err: std::fmt::Debug,
{
    T::from_str(value).map_err(|err| {
        Report::new(Error::InvalidData(field))
            .attach_printable(format!("{value}: {err:?}"))
    })
}

fn decode_optional<T>(field: &'static str, value: Option<&str>) -> Result<Option<T>, Error>
where
    T: FromStr,
    T::Err: std::fmt::Debug,
{
    value.map(|value| decode(field, value)).transpose()
}

#[cfg(test)]
pub(crate) async fn in_memory() -> Repositories {
    Repositories::new(crate::storage::in_memory().await)
}
