// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;

use cid::Cid;
use fil_markets_runtime::carstore::write_car;
use fil_markets_runtime::commp::generate_piece_commitment;
use fil_markets_runtime::piecestore::BlockLocation;
use fil_markets_runtime::traversal::{traverse_blockstore, Selector};
use fil_markets_runtime::DealError;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::piece::PaddedPieceSize;

/// A payload DAG packed as a piece: the CAR holding it and the CAR's commitment.
#[derive(Clone, Debug)]
pub struct PieceData {
    pub car: Vec<u8>,
    pub piece_cid: Cid,
    pub piece_size: PaddedPieceSize,
    pub blocks: Vec<(Cid, Vec<u8>)>,
}

impl PieceData {
    /// Where each block's data sits, counting only block bytes, in traversal order.
    pub fn block_locations(&self) -> BTreeMap<Cid, BlockLocation> {
        let mut offset = 0;
        self.blocks
            .iter()
            .map(|(cid, data)| {
                let location = BlockLocation { rel_offset: offset, block_size: data.len() as u64 };
                offset += data.len() as u64;
                (*cid, location)
            })
            .collect()
    }
}

/// Packs the whole DAG under `root` into a CAR and computes its piece commitment.
pub async fn prepare_piece<BS: Blockstore>(store: &BS, root: Cid) -> Result<PieceData, DealError> {
    let blocks = traverse_blockstore(store, root, Selector::all())?;
    let car = write_car(vec![root], blocks.clone()).await?;
    let (piece_cid, piece_size) = generate_piece_commitment(&car)?;
    Ok(PieceData { car, piece_cid, piece_size, blocks })
}

#[cfg(test)]
mod tests {
    use fil_markets_runtime::blockstore::MemoryBlockstore;
    use fil_markets_runtime::test_utils::build_dag;

    use super::*;

    #[tokio::test]
    async fn same_dag_same_commitment() {
        let dag = build_dag(11, 200, &[300, 500]).unwrap();
        let a = MemoryBlockstore::shared();
        let b = MemoryBlockstore::shared();
        dag.put_into(&a).unwrap();
        dag.put_into(&b).unwrap();

        let pa = prepare_piece(&a, dag.root).await.unwrap();
        let pb = prepare_piece(&b, dag.root).await.unwrap();
        assert_eq!(pa.piece_cid, pb.piece_cid);
        assert_eq!(pa.piece_size, pb.piece_size);
        assert_eq!(pa.blocks.len(), 3);

        let locations = pa.block_locations();
        assert_eq!(locations[&dag.root].rel_offset, 0);
        let total: u64 = locations.values().map(|l| l.block_size).sum();
        assert_eq!(total, dag.total_size());
    }

    #[tokio::test]
    async fn missing_blocks_fail() {
        let dag = build_dag(12, 200, &[100]).unwrap();
        let store = MemoryBlockstore::shared();
        let err = prepare_piece(&store, dag.root).await.unwrap_err();
        assert_eq!(err.kind(), fil_markets_runtime::ErrorKind::NotFound);
    }
}
