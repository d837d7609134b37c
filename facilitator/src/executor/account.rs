use std::cmp;
use std::sync::Arc;

use alloy_primitives::{Address, Bytes};
use error_stack::Result;
use tokio::sync::Mutex;
use tracing::debug;

use crate::chain::{ChainClient, Error, Transaction};
use crate::types::Hash;

/// Signing account on one chain. Submissions are serialized from nonce assignment until the node has
/// accepted the transaction, so two transactions of the same account never race for a nonce.
pub struct Account<C> {
    client: Arc<C>,
    address: Address,
    next_nonce: Mutex<Option<u64>>,
}

impl<C> Account<C>
where
    C: ChainClient,
{
    pub fn new(client: Arc<C>, address: Address) -> Self {
        Self {
            client,
            address,
            next_nonce: Mutex::new(None),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Broadcasts a call to `to` and returns the transaction hash. Waiting for the receipt is up to the
    /// caller.
    pub async fn submit(&self, to: Address, data: Bytes) -> Result<Hash, Error> {
        let mut next_nonce = self.next_nonce.lock().await;

        let chain_nonce = self.client.transaction_count(self.address).await?;
        let nonce = next_nonce.map_or(chain_nonce, |local| cmp::max(local, chain_nonce));

        let result = self
            .client
            .broadcast(Transaction {
                from: self.address,
                to,
                data,
                nonce,
            })
            .await;

        // the chain is the source of truth again after a failed broadcast
        *next_nonce = match result {
            Ok(_) => nonce.checked_add(1),
            Err(_) => None,
        };
        debug!(account = %self.address, nonce, succeeded = result.is_ok(), "broadcast transaction");

        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use error_stack::report;
    use mockall::predicate::eq;
    use tokio::task::JoinSet;

    use super::*;
    use crate::chain::MockChainClient;

    fn transaction_hash() -> Hash {
        Hash::repeat_byte(1)
    }

    #[tokio::test]
    async fn local_nonce_runs_ahead_of_a_lagging_chain() {
        let mut client = MockChainClient::new();
        client
            .expect_transaction_count()
            .with(eq(Address::repeat_byte(1)))
            .returning(|_| Ok(5));
        let mut seq = mockall::Sequence::new();
        for nonce in [5, 6, 7] {
            client
                .expect_broadcast()
                .withf(move |tx| tx.nonce == nonce)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(transaction_hash()));
        }

        let account = Account::new(Arc::new(client), Address::repeat_byte(1));
        for _ in 0..3 {
            assert!(account
                .submit(Address::repeat_byte(2), Bytes::new())
                .await
                .is_ok());
        }
    }

    #[tokio::test]
    async fn nonce_is_refreshed_from_the_chain_after_a_contention() {
        let mut client = MockChainClient::new();
        let mut counts = mockall::Sequence::new();
        client
            .expect_transaction_count()
            .times(1)
            .in_sequence(&mut counts)
            .returning(|_| Ok(3));
        client
            .expect_transaction_count()
            .times(1)
            .in_sequence(&mut counts)
            .returning(|_| Ok(1));
        client
            .expect_broadcast()
            .withf(|tx| tx.nonce == 3)
            .times(1)
            .returning(|_| Err(report!(Error::NonceContention)));
        client
            .expect_broadcast()
            .withf(|tx| tx.nonce == 1)
            .times(1)
            .returning(|_| Ok(transaction_hash()));

        let account = Account::new(Arc::new(client), Address::repeat_byte(1));

        assert!(account
            .submit(Address::repeat_byte(2), Bytes::new())
            .await
            .is_err());
        assert!(account
            .submit(Address::repeat_byte(2), Bytes::new())
            .await
            .is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_submissions_never_share_a_nonce() {
        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = sent.clone();

        let mut client = MockChainClient::new();
        client.expect_transaction_count().returning(|_| Ok(0));
        client.expect_broadcast().returning(move |tx| {
            std::thread::sleep(Duration::from_millis(5));
            recorded.lock().unwrap().push(tx.nonce);
            Ok(transaction_hash())
        });

        let account = Arc::new(Account::new(Arc::new(client), Address::repeat_byte(1)));
        let mut set = JoinSet::new();
        for _ in 0..10 {
            let account = account.clone();
            set.spawn(async move {
                account
                    .submit(Address::repeat_byte(2), Bytes::new())
                    .await
                    .unwrap()
            });
        }
        while set.join_next().await.is_some() {}

        let mut nonces = sent.lock().unwrap().clone();
        nonces.sort();
        assert_eq!(nonces, (0..10).collect::<Vec<u64>>());
    }
}
