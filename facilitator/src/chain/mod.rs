use alloy_primitives::{Address, Bytes};
use async_trait::async_trait;
use error_stack::Result;
use mockall::automock;
use thiserror::Error;

use crate::types::Hash;

pub mod abi;
pub mod evm;
pub mod json_rpc;
pub mod proof;

pub use proof::{AccountProof, StorageProof};

/// Chain interaction failures, classified by whether repeating the call can succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("failed to reach the chain node")]
    Network,
    #[error("timed out waiting for the transaction to be mined")]
    Timeout,
    #[error("transaction nonce is already taken")]
    NonceContention,
    #[error("transaction was rejected")]
    Rejected,
    #[error("chain node returned an invalid response")]
    InvalidResponse,
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network | Error::Timeout | Error::NonceContention
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub nonce: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: Hash,
    pub block_number: u64,
}

#[automock]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Height of the latest source chain state root anchored by `anchor` on this chain.
    async fn latest_anchored_block_number(&self, anchor: Address) -> Result<u64, Error>;

    async fn proof(
        &self,
        address: Address,
        storage_keys: Vec<Hash>,
        block_number: u64,
    ) -> Result<AccountProof, Error>;

    /// Number of transactions sent by `account`, including the ones still pending.
    async fn transaction_count(&self, account: Address) -> Result<u64, Error>;

    /// Hands the transaction to the node and returns its hash without waiting for it to be mined.
    async fn broadcast(&self, tx: Transaction) -> Result<Hash, Error>;

    /// Waits until the transaction is mined successfully. A transaction that is still unmined when
    /// this times out can be awaited again.
    async fn wait_for_receipt(&self, transaction_hash: Hash) -> Result<Receipt, Error>;
}
