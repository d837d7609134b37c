use std::time::Duration;

use alloy_primitives::{Address, Bytes, U256, U64};
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use error_stack::{report, Result, ResultExt};
use ethers_providers::JsonRpcClient;
use serde::Deserialize;
use serde_json::json;
use tokio::time;
use tracing::debug;
use typed_builder::TypedBuilder;

use super::abi::getLatestStateRootBlockNumberCall;
use super::json_rpc::Client;
use super::{AccountProof, ChainClient, Error, Receipt, StorageProof, Transaction};
use crate::types::Hash;

/// [`ChainClient`] for EVM nodes that hold the worker account unlocked.
#[derive(TypedBuilder)]
pub struct EvmClient<P>
where
    P: JsonRpcClient,
{
    client: Client<P>,
    gas_price: u64,
    gas_limit: u64,
    #[builder(default = Duration::from_secs(2))]
    confirmation_poll_interval: Duration,
    #[builder(default = Duration::from_secs(120))]
    confirmation_timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProofResponse {
    nonce: U64,
    balance: U256,
    storage_hash: Hash,
    code_hash: Hash,
    account_proof: Vec<Bytes>,
    storage_proof: Vec<StorageProofResponse>,
}

#[derive(Deserialize)]
struct StorageProofResponse {
    value: U256,
    proof: Vec<Bytes>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptResponse {
    transaction_hash: Hash,
    block_number: Option<U64>,
    status: Option<U64>,
}

struct MinedReceipt {
    transaction_hash: Hash,
    block_number: u64,
    succeeded: bool,
}

impl From<ProofResponse> for AccountProof {
    fn from(response: ProofResponse) -> Self {
        AccountProof {
            nonce: response.nonce.to::<u64>(),
            balance: response.balance,
            storage_hash: response.storage_hash,
            code_hash: response.code_hash,
            account_proof: response.account_proof,
            storage_proof: response
                .storage_proof
                .into_iter()
                .map(|storage| StorageProof {
                    value: storage.value,
                    proof: storage.proof,
                })
                .collect(),
        }
    }
}

fn quantity(value: u64) -> String {
    format!("{value:#x}")
}

impl<P> EvmClient<P>
where
    P: JsonRpcClient + Send + Sync + 'static,
{
    async fn receipt(&self, hash: Hash) -> Result<Option<ReceiptResponse>, Error> {
        self.client
            .request("eth_getTransactionReceipt", [hash])
            .await
    }

    async fn mined_receipt(&self, hash: Hash) -> Result<MinedReceipt, Error> {
        loop {
            match self.receipt(hash).await? {
                Some(ReceiptResponse {
                    transaction_hash,
                    block_number: Some(block_number),
                    status,
                }) => {
                    return Ok(MinedReceipt {
                        transaction_hash,
                        block_number: block_number.to::<u64>(),
                        succeeded: status != Some(U64::ZERO),
                    })
                }
                _ => time::sleep(self.confirmation_poll_interval).await,
            }
        }
    }
}

#[async_trait]
impl<P> ChainClient for EvmClient<P>
where
    P: JsonRpcClient + Send + Sync + 'static,
{
    async fn latest_anchored_block_number(&self, anchor: Address) -> Result<u64, Error> {
        let call = json!({
            "to": anchor,
            "data": Bytes::from(getLatestStateRootBlockNumberCall {}.abi_encode()),
        });
        let output: Bytes = self.client.request("eth_call", (call, "latest")).await?;

        let block_number = getLatestStateRootBlockNumberCall::abi_decode_returns(&output, true)
            .change_context(Error::InvalidResponse)?
            .blockNumber;

        u64::try_from(block_number).map_err(|_| {
            report!(Error::InvalidResponse)
                .attach_printable(format!("block number: {block_number}"))
        })
    }

    async fn proof(
        &self,
        address: Address,
        storage_keys: Vec<Hash>,
        block_number: u64,
    ) -> Result<AccountProof, Error> {
        let response: ProofResponse = self
            .client
            .request(
                "eth_getProof",
                (address, storage_keys, quantity(block_number)),
            )
            .await?;

        Ok(response.into())
    }

    async fn transaction_count(&self, account: Address) -> Result<u64, Error> {
        let count: U64 = self
            .client
            .request("eth_getTransactionCount", (account, "pending"))
            .await?;

        Ok(count.to::<u64>())
    }

    async fn broadcast(&self, tx: Transaction) -> Result<Hash, Error> {
        let request = json!({
            "from": tx.from,
            "to": tx.to,
            "data": tx.data,
            "nonce": quantity(tx.nonce),
            "gas": quantity(self.gas_limit),
            "gasPrice": quantity(self.gas_price),
        });
        let hash: Hash = self
            .client
            .request("eth_sendTransaction", [request])
            .await?;

        debug!(%hash, nonce = tx.nonce, "sent transaction");

        Ok(hash)
    }

    async fn wait_for_receipt(&self, hash: Hash) -> Result<Receipt, Error> {
        let receipt = time::timeout(self.confirmation_timeout, self.mined_receipt(hash))
            .await
            .change_context(Error::Timeout)
            .attach_printable_lazy(|| format!("transaction: {hash}"))??;

        if !receipt.succeeded {
            return Err(report!(Error::Rejected)).attach_printable(format!(
                "transaction {} reverted in block {}",
                receipt.transaction_hash, receipt.block_number
            ));
        }

        Ok(Receipt {
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
        })
    }
}
