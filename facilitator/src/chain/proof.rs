use alloy_primitives::{keccak256, Bytes, U256};
use ethers_core::utils::rlp::RlpStream;

use crate::types::Hash;

/// Merkle proof of an account and some of its storage slots at a given block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountProof {
    pub nonce: u64,
    pub balance: U256,
    pub storage_hash: Hash,
    pub code_hash: Hash,
    pub account_proof: Vec<Bytes>,
    pub storage_proof: Vec<StorageProof>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageProof {
    pub value: U256,
    pub proof: Vec<Bytes>,
}

impl AccountProof {
    /// The account as it is stored in the state trie: `rlp([nonce, balance, storageHash, codeHash])`.
    pub fn encoded_account(&self) -> Bytes {
        let mut stream = RlpStream::new_list(4);
        stream.append(&self.nonce);
        stream.append(&self.balance.to_be_bytes_trimmed_vec());
        stream.append(&self.storage_hash.to_vec());
        stream.append(&self.code_hash.to_vec());

        stream.out().to_vec().into()
    }

    pub fn encoded_account_proof(&self) -> Bytes {
        encode_parent_nodes(&self.account_proof)
    }

    /// Parent nodes of the storage slot at `index` in the requested storage keys.
    pub fn encoded_storage_proof(&self, index: usize) -> Option<Bytes> {
        self.storage_proof
            .get(index)
            .map(|storage| encode_parent_nodes(&storage.proof))
    }
}

/// Trie nodes are already rlp encoded, so they are embedded as they are.
fn encode_parent_nodes(nodes: &[Bytes]) -> Bytes {
    let mut stream = RlpStream::new_list(nodes.len());
    for node in nodes {
        stream.append_raw(node, 1);
    }

    stream.out().to_vec().into()
}

/// Storage key of a message in a gateway outbox mapping declared at `index`.
pub fn outbox_storage_key(message_hash: Hash, index: u64) -> Hash {
    let mut preimage = [0u8; 64];
    preimage[..32].copy_from_slice(message_hash.as_slice());
    preimage[32..].copy_from_slice(&U256::from(index).to_be_bytes::<32>());

    keccak256(preimage)
}
