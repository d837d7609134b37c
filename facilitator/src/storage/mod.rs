use error_stack::{Result, ResultExt};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, EntityTrait, Schema};
use thiserror::Error;
use tracing::info;

pub mod entities;

use entities::{
    deposit_intents, erc20_gateway_token_pairs, gateways, messages, withdraw_intents,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to connect to the database")]
    Connection,
    #[error("failed to create table {0}")]
    CreateTable(String),
}

pub async fn connect(url: &str) -> Result<DatabaseConnection, Error> {
    Database::connect(url).await.change_context(Error::Connection)
}

/// Creates every table the facilitator needs unless it already exists.
pub async fn create_tables(db: &DatabaseConnection) -> Result<(), Error> {
    create_table(db, messages::Entity).await?;
    create_table(db, gateways::Entity).await?;
    create_table(db, deposit_intents::Entity).await?;
    create_table(db, withdraw_intents::Entity).await?;
    create_table(db, erc20_gateway_token_pairs::Entity).await?;

    Ok(())
}

async fn create_table<E>(db: &DatabaseConnection, entity: E) -> Result<(), Error>
where
    E: EntityTrait,
{
    let table = entity.table_name().to_owned();
    let backend = db.get_database_backend();

    let mut statement = Schema::new(backend).create_table_from_entity(entity);
    statement.if_not_exists();

    db.execute(backend.build(&statement))
        .await
        .change_context(Error::CreateTable(table.clone()))?;
    info!(table, "database table ready");

    Ok(())
}

/// Every pooled connection would open its own in-memory database, so the pool is limited to one.
#[cfg(test)]
pub async fn in_memory() -> DatabaseConnection {
    let mut options = sea_orm::ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).min_connections(1);

    let db = Database::connect(options).await.unwrap();
    create_tables(&db).await.unwrap();
    db
}
