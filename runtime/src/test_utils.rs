// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::ipld::Node;
use crate::util::cid::{cbor_cid, raw_cid};
use crate::util::AsDealErrors;
use crate::{deal_error, DealError};

/// Routes `log` output to stderr; safe to call from every test.
pub fn init_logging() {
    let _ = pretty_env_logger::try_init();
}

/// Deterministic pseudo-random bytes.
pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = vec![0u8; len];
    rng.fill_bytes(&mut out);
    out
}

/// A two-level payload DAG: a DAG-CBOR root linking raw leaves.
#[derive(Clone, Debug)]
pub struct TestDag {
    pub root: Cid,
    /// Every block in traversal order, root first.
    pub blocks: Vec<(Cid, Vec<u8>)>,
}

impl TestDag {
    pub fn total_size(&self) -> u64 {
        self.blocks.iter().map(|(_, b)| b.len() as u64).sum()
    }

    /// Leaf bytes concatenated in order: the file the DAG encodes.
    pub fn file(&self) -> Vec<u8> {
        self.blocks.iter().skip(1).flat_map(|(_, b)| b.iter().copied()).collect()
    }

    pub fn put_into<BS: Blockstore>(&self, store: &BS) -> Result<(), DealError> {
        for (cid, data) in &self.blocks {
            store.put_keyed(cid, data).or_illegal_state("failed to store test block")?;
        }
        Ok(())
    }
}

/// Builds a DAG whose root encodes to exactly `root_size` bytes and whose leaves have the
/// given sizes.
pub fn build_dag(seed: u64, root_size: usize, leaf_sizes: &[usize]) -> Result<TestDag, DealError> {
    let leaves: Vec<(Cid, Vec<u8>)> = leaf_sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| {
            let data = random_bytes(seed + i as u64, size);
            Ok((raw_cid(&data)?, data))
        })
        .collect::<Result<_, DealError>>()?;

    let encode = |pad: usize| {
        Node::map([
            ("Links", Node::List(leaves.iter().map(|(c, _)| Node::Link(*c)).collect())),
            ("Data", Node::Bytes(vec![0u8; pad])),
        ])
        .encode()
    };
    let mut pad = 0usize;
    let mut root_bytes = encode(pad)?;
    for _ in 0..8 {
        if root_bytes.len() == root_size {
            break;
        }
        if root_bytes.len() < root_size {
            pad += root_size - root_bytes.len();
        } else {
            pad = pad.saturating_sub(root_bytes.len() - root_size);
        }
        root_bytes = encode(pad)?;
    }
    if root_bytes.len() != root_size {
        return Err(deal_error!(illegal_argument; "cannot build a root of exactly {} bytes", root_size));
    }

    let root = cbor_cid(&root_bytes)?;
    let mut blocks = vec![(root, root_bytes)];
    blocks.extend(leaves);
    Ok(TestDag { root, blocks })
}
