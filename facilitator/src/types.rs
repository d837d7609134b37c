use std::cmp::Ordering;

use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub type Hash = B256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Origin,
    Auxiliary,
}

/// Direction of value movement. Deposits go from origin to auxiliary, withdraws the other way.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Deposit,
    Withdraw,
}

/// Declaration status of a message on one chain. The variant order is the only allowed direction of change.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Undeclared,
    Declared,
}

/// Canonical record of one cross-chain message.
///
/// Optional fields set to `None` are treated as "not supplied" when saving, so a partially filled message
/// never erases what the store already knows. Timestamps are owned by the store and ignored on save.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub message_hash: Hash,
    pub message_type: MessageType,
    pub source_status: MessageStatus,
    pub target_status: MessageStatus,
    /// Gateway on the chain the message was declared on.
    pub gateway_address: Address,
    pub intent_hash: Option<Hash>,
    pub fee_gas_price: Option<U256>,
    pub fee_gas_limit: Option<U256>,
    pub source_declaration_block_number: Option<u64>,
    pub sender: Option<Address>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(
        message_hash: Hash,
        message_type: MessageType,
        source_status: MessageStatus,
        target_status: MessageStatus,
        gateway_address: Address,
    ) -> Self {
        Self {
            message_hash,
            message_type,
            source_status,
            target_status,
            gateway_address,
            intent_hash: None,
            fee_gas_price: None,
            fee_gas_limit: None,
            source_declaration_block_number: None,
            sender: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// Declared on the source chain but not yet on the target chain.
    pub fn is_pending(&self) -> bool {
        self.source_status == MessageStatus::Declared
            && self.target_status == MessageStatus::Undeclared
    }

    /// Pending and declared at or below `block_height`.
    pub fn is_ready_at(&self, block_height: u64) -> bool {
        self.is_pending()
            && self
                .source_declaration_block_number
                .is_some_and(|declared_at| declared_at <= block_height)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Gateway {
    pub gateway_address: Address,
    pub remote_gateway_address: Address,
    pub chain: Chain,
    /// Contract on `chain` that anchors state roots of the remote chain.
    pub anchor_address: Address,
    /// Highest block of the remote chain at which the remote gateway was proven to this gateway.
    pub remote_gateway_last_proven_block_number: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Gateway {
    pub fn new(
        gateway_address: Address,
        remote_gateway_address: Address,
        chain: Chain,
        anchor_address: Address,
    ) -> Self {
        Self {
            gateway_address,
            remote_gateway_address,
            chain,
            anchor_address,
            remote_gateway_last_proven_block_number: None,
            created_at: None,
            updated_at: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DepositIntent {
    pub message_hash: Hash,
    pub intent_hash: Option<Hash>,
    pub value_token: Address,
    pub amount: U256,
    pub beneficiary: Address,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct WithdrawIntent {
    pub message_hash: Hash,
    pub intent_hash: Option<Hash>,
    pub utility_token: Address,
    pub amount: U256,
    pub beneficiary: Address,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

// intents are identified by their message alone
macro_rules! order_by_message_hash {
    ($intent:ty) => {
        impl PartialEq for $intent {
            fn eq(&self, other: &Self) -> bool {
                self.message_hash == other.message_hash
            }
        }

        impl Eq for $intent {}

        impl PartialOrd for $intent {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $intent {
            fn cmp(&self, other: &Self) -> Ordering {
                self.message_hash.cmp(&other.message_hash)
            }
        }
    };
}

order_by_message_hash!(DepositIntent);
order_by_message_hash!(WithdrawIntent);

/// Utility token minted on the auxiliary chain for a value token of an origin gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Erc20GatewayTokenPair {
    /// Origin chain gateway the value token belongs to.
    pub gateway_address: Address,
    pub value_token: Address,
    pub utility_token: Address,
    pub created_at: Option<DateTime<Utc>>,
}

impl Erc20GatewayTokenPair {
    pub fn new(gateway_address: Address, value_token: Address, utility_token: Address) -> Self {
        Self {
            gateway_address,
            value_token,
            utility_token,
            created_at: None,
        }
    }
}
