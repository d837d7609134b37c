use std::time::Duration;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

use crate::event_sub;
use crate::executor;
use crate::url::Url;

/// Slot of the outbox mapping in the gateway storage layout.
const DEFAULT_OUTBOX_STORAGE_INDEX: u64 = 7;

#[derive(Deserialize, Serialize, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    #[serde(deserialize_with = "Url::deserialize_sensitive")]
    pub database_url: Url,
    /// Zero disables the periodic resubscription to the event feeds.
    #[serde(with = "humantime_serde")]
    pub restart_interval: Duration,
    pub executor: executor::Config,
    pub feed: event_sub::Config,
    pub origin: ChainConfig,
    pub auxiliary: ChainConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: Url::new_sensitive("sqlite://facilitator.db?mode=rwc")
                .expect("url should be valid"),
            restart_interval: Duration::from_secs(600),
            executor: executor::Config::default(),
            feed: event_sub::Config::default(),
            origin: ChainConfig::local(8545, 8000),
            auxiliary: ChainConfig::local(8546, 8001),
        }
    }
}

/// Contracts, worker account and endpoints of one chain.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct ChainConfig {
    #[serde(deserialize_with = "Url::deserialize_sensitive")]
    pub rpc_url: Url,
    #[serde(deserialize_with = "Url::deserialize_non_sensitive")]
    pub subgraph_url: Url,
    /// Unlocked account on the node that signs transactions sent to this chain.
    pub worker: Address,
    pub gateway: Address,
    /// Anchors state roots of the other chain.
    pub anchor: Address,
    pub outbox_storage_index: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    #[serde(with = "humantime_serde")]
    pub confirmation_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub confirmation_timeout: Duration,
}

impl ChainConfig {
    fn local(rpc_port: u16, subgraph_port: u16) -> Self {
        Self {
            rpc_url: Url::new_sensitive(&format!("http://localhost:{rpc_port}"))
                .expect("url should be valid"),
            subgraph_url: Url::new_non_sensitive(&format!(
                "http://localhost:{subgraph_port}/subgraphs/name/facilitator"
            ))
            .expect("url should be valid"),
            worker: Address::ZERO,
            gateway: Address::ZERO,
            anchor: Address::ZERO,
            outbox_storage_index: DEFAULT_OUTBOX_STORAGE_INDEX,
            gas_price: 1_000_000_000,
            gas_limit: 5_000_000,
            confirmation_poll_interval: Duration::from_secs(2),
            confirmation_timeout: Duration::from_secs(300),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::local(8545, 8000)
    }
}
