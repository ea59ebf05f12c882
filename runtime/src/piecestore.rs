// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::deal::DealID;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::sector::SectorNumber;
use thiserror::Error;

use crate::DealError;

/// Where a piece lives: the deal that stored it and its place in the sector.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Copy, Debug, PartialEq, Eq)]
pub struct DealInfo {
    pub deal_id: DealID,
    pub sector_id: SectorNumber,
    pub offset: PaddedPieceSize,
    pub length: PaddedPieceSize,
}

/// Position of a block inside an unsealed piece.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockLocation {
    pub rel_offset: u64,
    pub block_size: u64,
}

#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct PieceBlockLocation {
    pub location: BlockLocation,
    pub piece_cid: Cid,
}

#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct PieceInfo {
    pub piece_cid: Cid,
    pub deals: Vec<DealInfo>,
}

#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct CidInfo {
    pub cid: Cid,
    pub piece_block_locations: Vec<PieceBlockLocation>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PieceStoreError {
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Failed(String),
}

impl From<PieceStoreError> for DealError {
    fn from(e: PieceStoreError) -> Self {
        match e {
            PieceStoreError::NotFound => DealError::not_found(e.to_string()),
            PieceStoreError::Failed(msg) => DealError::illegal_state(msg),
        }
    }
}

/// Index from payload blocks to the pieces holding them, and from pieces to the deals and
/// sectors that store them.
pub trait PieceStore: Send + Sync {
    fn add_deal_for_piece(&self, piece_cid: Cid, deal: DealInfo) -> Result<(), PieceStoreError>;
    fn add_piece_block_locations(
        &self,
        piece_cid: Cid,
        locations: BTreeMap<Cid, BlockLocation>,
    ) -> Result<(), PieceStoreError>;
    fn get_piece_info(&self, piece_cid: &Cid) -> Result<PieceInfo, PieceStoreError>;
    fn get_cid_info(&self, cid: &Cid) -> Result<CidInfo, PieceStoreError>;
    fn list_pieces(&self) -> Result<Vec<Cid>, PieceStoreError>;
}

#[derive(Default)]
struct Indexes {
    pieces: HashMap<Cid, PieceInfo>,
    cids: HashMap<Cid, CidInfo>,
    broken_pieces: HashSet<Cid>,
    broken_cids: HashSet<Cid>,
}

/// In-memory piece store. Lookups can be made to fail on purpose, which is how tests model
/// a lookup that errors for reasons other than a missing entry.
#[derive(Default)]
pub struct MemoryPieceStore {
    inner: RwLock<Indexes>,
}

impl MemoryPieceStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Makes every later `get_piece_info` for this piece fail with "GetPieceInfo failed".
    pub fn fail_piece_info(&self, piece_cid: Cid) {
        if let Ok(mut inner) = self.inner.write() {
            inner.broken_pieces.insert(piece_cid);
        }
    }

    /// Makes every later `get_cid_info` for this block fail with "GetCIDInfo failed".
    pub fn fail_cid_info(&self, cid: Cid) {
        if let Ok(mut inner) = self.inner.write() {
            inner.broken_cids.insert(cid);
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Indexes>, PieceStoreError> {
        self.inner.read().map_err(|_| PieceStoreError::Failed("piece store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Indexes>, PieceStoreError> {
        self.inner.write().map_err(|_| PieceStoreError::Failed("piece store lock poisoned".into()))
    }
}

impl PieceStore for MemoryPieceStore {
    fn add_deal_for_piece(&self, piece_cid: Cid, deal: DealInfo) -> Result<(), PieceStoreError> {
        let mut inner = self.write()?;
        let info = inner
            .pieces
            .entry(piece_cid)
            .or_insert_with(|| PieceInfo { piece_cid, deals: Vec::new() });
        if !info.deals.contains(&deal) {
            info.deals.push(deal);
        }
        Ok(())
    }

    fn add_piece_block_locations(
        &self,
        piece_cid: Cid,
        locations: BTreeMap<Cid, BlockLocation>,
    ) -> Result<(), PieceStoreError> {
        let mut inner = self.write()?;
        for (cid, location) in locations {
            let info = inner
                .cids
                .entry(cid)
                .or_insert_with(|| CidInfo { cid, piece_block_locations: Vec::new() });
            let entry = PieceBlockLocation { location, piece_cid };
            if !info.piece_block_locations.contains(&entry) {
                info.piece_block_locations.push(entry);
            }
        }
        Ok(())
    }

    fn get_piece_info(&self, piece_cid: &Cid) -> Result<PieceInfo, PieceStoreError> {
        let inner = self.read()?;
        if inner.broken_pieces.contains(piece_cid) {
            return Err(PieceStoreError::Failed("GetPieceInfo failed".into()));
        }
        inner.pieces.get(piece_cid).cloned().ok_or(PieceStoreError::NotFound)
    }

    fn get_cid_info(&self, cid: &Cid) -> Result<CidInfo, PieceStoreError> {
        let inner = self.read()?;
        if inner.broken_cids.contains(cid) {
            return Err(PieceStoreError::Failed("GetCIDInfo failed".into()));
        }
        inner.cids.get(cid).cloned().ok_or(PieceStoreError::NotFound)
    }

    fn list_pieces(&self) -> Result<Vec<Cid>, PieceStoreError> {
        let mut pieces: Vec<Cid> = self.read()?.pieces.keys().copied().collect();
        pieces.sort();
        Ok(pieces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::cid::raw_cid;

    #[test]
    fn lookups_distinguish_missing_from_failing() {
        let store = MemoryPieceStore::new();
        let piece = raw_cid(b"piece").unwrap();
        let block = raw_cid(b"block").unwrap();
        let deal = DealInfo {
            deal_id: 3,
            sector_id: 7,
            offset: PaddedPieceSize(0),
            length: PaddedPieceSize(2048),
        };

        assert_eq!(store.get_piece_info(&piece), Err(PieceStoreError::NotFound));
        store.add_deal_for_piece(piece, deal).unwrap();
        store.add_deal_for_piece(piece, deal).unwrap();
        store
            .add_piece_block_locations(piece, BTreeMap::from([(block, BlockLocation { rel_offset: 0, block_size: 5 })]))
            .unwrap();

        assert_eq!(store.get_piece_info(&piece).unwrap().deals, vec![deal]);
        assert_eq!(store.get_cid_info(&block).unwrap().piece_block_locations[0].piece_cid, piece);
        assert_eq!(store.list_pieces().unwrap(), vec![piece]);

        store.fail_cid_info(block);
        let err = store.get_cid_info(&block).unwrap_err();
        assert_eq!(err.to_string(), "GetCIDInfo failed");
        assert_eq!(DealError::from(err).kind(), crate::ErrorKind::IllegalState);
        assert_eq!(DealError::from(PieceStoreError::NotFound).kind(), crate::ErrorKind::NotFound);
    }
}
