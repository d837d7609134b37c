use alloy_primitives::Address;
use async_trait::async_trait;
use error_stack::{Result, ResultExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{handle_concurrently, Error, EventHandler};
use crate::repositories::Repositories;
use crate::types::Erc20GatewayTokenPair;

/// Utility token created by an auxiliary chain co-gateway for a value token of its origin gateway.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedUtilityToken {
    pub value_token_address: Address,
    pub utility_token_address: Address,
    pub contract_address: Address,
}

pub struct Handler {
    repositories: Repositories,
}

impl Handler {
    pub fn new(repositories: Repositories) -> Self {
        Self { repositories }
    }

    async fn handle_record(&self, record: CreatedUtilityToken) -> Result<(), Error> {
        let Some(gateway) = self
            .repositories
            .gateways
            .get(record.contract_address)
            .await
            .change_context(Error::Store)?
        else {
            debug!(
                contract_address = %record.contract_address,
                "ignoring utility token created by unknown gateway"
            );
            return Ok(());
        };

        let stored = self
            .repositories
            .token_pairs
            .save_if_absent(Erc20GatewayTokenPair::new(
                gateway.remote_gateway_address,
                record.value_token_address,
                record.utility_token_address,
            ))
            .await
            .change_context(Error::Store)?;

        if stored {
            info!(
                gateway = %gateway.remote_gateway_address,
                value_token = %record.value_token_address,
                utility_token = %record.utility_token_address,
                "registered token pair"
            );
        }

        Ok(())
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn handle(&self, records: Vec<Value>) -> Result<(), Error> {
        handle_concurrently(records, |record: CreatedUtilityToken| {
            self.handle_record(record)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::handlers::test_utils::{auxiliary_gateway, origin_gateway, seeded_repositories};

    fn record(value_token: u8, utility_token: u8, contract_address: Address) -> Value {
        json!({
            "valueTokenAddress": Address::repeat_byte(value_token),
            "utilityTokenAddress": Address::repeat_byte(utility_token),
            "contractAddress": contract_address,
        })
    }

    #[tokio::test]
    async fn pair_is_keyed_by_the_origin_gateway() {
        let repositories = seeded_repositories().await;
        let handler = Handler::new(repositories.clone());

        handler
            .handle(vec![record(1, 2, auxiliary_gateway())])
            .await
            .unwrap();

        let pair = repositories
            .token_pairs
            .get(origin_gateway(), Address::repeat_byte(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pair.utility_token, Address::repeat_byte(2));
    }

    #[tokio::test]
    async fn first_observation_wins() {
        let repositories = seeded_repositories().await;
        let handler = Handler::new(repositories.clone());

        handler
            .handle(vec![record(1, 2, auxiliary_gateway())])
            .await
            .unwrap();
        handler
            .handle(vec![record(1, 3, auxiliary_gateway())])
            .await
            .unwrap();

        let pair = repositories
            .token_pairs
            .get(origin_gateway(), Address::repeat_byte(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pair.utility_token, Address::repeat_byte(2));
    }

    #[tokio::test]
    async fn tokens_of_unknown_gateways_are_ignored() {
        let repositories = seeded_repositories().await;
        let handler = Handler::new(repositories.clone());

        handler
            .handle(vec![record(1, 2, Address::repeat_byte(0x99))])
            .await
            .unwrap();

        assert!(repositories
            .token_pairs
            .find_by_utility_token(origin_gateway(), Address::repeat_byte(2))
            .await
            .unwrap()
            .is_none());
    }
}
