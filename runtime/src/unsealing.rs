// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::piece::UnpaddedPieceSize;
use fvm_shared::sector::SectorNumber;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::blockstore::SharedBlockstore;
use crate::carstore::load_car_bytes;
use crate::piecestore::{PieceInfo, PieceStore};
use crate::util::AsDealErrors;
use crate::{deal_error, DealContext, DealError};

/// Access to the sealing backend: reads unsealed copies of pieces out of sectors.
#[async_trait]
pub trait SectorAccessor: Send + Sync {
    /// Whether the sector already holds an unsealed copy of the range.
    async fn is_unsealed(
        &self,
        sector_id: SectorNumber,
        offset: UnpaddedPieceSize,
        length: UnpaddedPieceSize,
    ) -> Result<bool, DealError>;

    /// Returns the unsealed bytes of the range: a CAR of the piece's payload.
    async fn unseal_sector(
        &self,
        sector_id: SectorNumber,
        offset: UnpaddedPieceSize,
        length: UnpaddedPieceSize,
    ) -> Result<Vec<u8>, DealError>;
}

/// Unseals `piece` from the first deal that works, trying deals whose sector already has an
/// unsealed copy before any others.
pub async fn first_successful_unseal(
    piece: &PieceInfo,
    accessor: &dyn SectorAccessor,
) -> Result<Vec<u8>, DealError> {
    let mut last_err = deal_error!(not_found; "no sectors found to unseal from");
    let mut tried = Vec::new();

    for deal in &piece.deals {
        let (offset, length) = (deal.offset.unpadded(), deal.length.unpadded());
        match accessor.is_unsealed(deal.sector_id, offset, length).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                debug!("failed to check unsealed state of sector {}: {}", deal.sector_id, e);
                continue;
            }
        }
        tried.push(deal.deal_id);
        match accessor.unseal_sector(deal.sector_id, offset, length).await {
            Ok(data) => return Ok(data),
            Err(e) => {
                warn!("failed to read unsealed piece {} from sector {}: {}", piece.piece_cid, deal.sector_id, e);
                last_err = e;
            }
        }
    }

    for deal in piece.deals.iter().filter(|d| !tried.contains(&d.deal_id)) {
        let (offset, length) = (deal.offset.unpadded(), deal.length.unpadded());
        match accessor.unseal_sector(deal.sector_id, offset, length).await {
            Ok(data) => {
                info!("unsealed piece {} from sector {}", piece.piece_cid, deal.sector_id);
                return Ok(data);
            }
            Err(e) => {
                warn!("failed to unseal piece {} from sector {}: {}", piece.piece_cid, deal.sector_id, e);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

enum PieceOutcome {
    Unsealed,
    Skipped,
    Failed(DealError),
}

/// Block loader that unseals the piece holding a block when the block is not cached yet.
///
/// Safe to share between deals: unsealing of any one piece is serialised, and a block that
/// another deal has just unsealed is served from the cache.
pub struct UnsealingLoader {
    store: SharedBlockstore,
    pieces: Arc<dyn PieceStore>,
    accessor: Arc<dyn SectorAccessor>,
    locks: Mutex<HashMap<Cid, Arc<Mutex<()>>>>,
}

impl UnsealingLoader {
    pub fn new(
        store: SharedBlockstore,
        pieces: Arc<dyn PieceStore>,
        accessor: Arc<dyn SectorAccessor>,
    ) -> Self {
        Self { store, pieces, accessor, locks: Mutex::new(HashMap::new()) }
    }

    pub fn store(&self) -> &SharedBlockstore {
        &self.store
    }

    /// Returns the bytes of `cid`, unsealing a piece that contains it if necessary.
    pub async fn load(&self, cid: &Cid) -> Result<Vec<u8>, DealError> {
        if let Some(data) = self.cached(cid)? {
            return Ok(data);
        }
        self.unseal_block(cid).await?;
        self.cached(cid)?
            .ok_or_else(|| deal_error!(not_found; "block {} not found in unsealed pieces", cid))
    }

    async fn unseal_block(&self, cid: &Cid) -> Result<(), DealError> {
        let info = self
            .pieces
            .get_cid_info(cid)
            .map_err(DealError::from)
            .context("error looking up information on CID")?;

        let mut last_err = deal_error!(not_found; "no sectors found to unseal from");
        for location in &info.piece_block_locations {
            let lock = self.piece_lock(&location.piece_cid).await;
            let outcome = {
                let _guard = lock.lock().await;
                self.unseal_piece(cid, &location.piece_cid).await
            };
            self.release_piece_lock(&location.piece_cid, lock).await;
            match outcome? {
                PieceOutcome::Unsealed => return Ok(()),
                PieceOutcome::Skipped => {}
                PieceOutcome::Failed(e) => last_err = e,
            }
        }
        Err(last_err.wrap("Unable to unseal piece"))
    }

    /// Unseals `piece` into the store. Must be called with the piece's lock held.
    async fn unseal_piece(&self, cid: &Cid, piece_cid: &Cid) -> Result<PieceOutcome, DealError> {
        // Another deal may have unsealed this piece while we waited.
        if self.cached(cid)?.is_some() {
            return Ok(PieceOutcome::Unsealed);
        }
        let piece = match self.pieces.get_piece_info(piece_cid) {
            Ok(piece) => piece,
            Err(e) => {
                debug!("skipping piece {} for block {}: {}", piece_cid, cid, e);
                return Ok(PieceOutcome::Skipped);
            }
        };
        match first_successful_unseal(&piece, self.accessor.as_ref()).await {
            Ok(car) => {
                load_car_bytes(&self.store, &car).await?;
                Ok(PieceOutcome::Unsealed)
            }
            Err(e) => Ok(PieceOutcome::Failed(e)),
        }
    }

    fn cached(&self, cid: &Cid) -> Result<Option<Vec<u8>>, DealError> {
        self.store.get(cid).or_illegal_state("attempting to load cid from blockstore")
    }

    async fn piece_lock(&self, piece: &Cid) -> Arc<Mutex<()>> {
        self.locks.lock().await.entry(*piece).or_default().clone()
    }

    /// Drops the map entry for `piece` once no other deal holds or waits on its lock.
    async fn release_piece_lock(&self, piece: &Cid, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        let ours = locks.get(piece).is_some_and(|held| Arc::ptr_eq(held, &lock));
        // One reference in the map, one here.
        if ours && Arc::strong_count(&lock) == 2 {
            locks.remove(piece);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    use fvm_shared::piece::PaddedPieceSize;

    use super::*;
    use crate::blockstore::MemoryBlockstore;
    use crate::carstore::write_car;
    use crate::piecestore::{BlockLocation, DealInfo, MemoryPieceStore};
    use crate::util::cid::raw_cid;

    /// Sector 1 always fails, sector 2 returns the CAR; records every unseal call.
    struct FlakySectors {
        car: Vec<u8>,
        unsealed: Vec<SectorNumber>,
        calls: StdMutex<Vec<SectorNumber>>,
    }

    #[async_trait]
    impl SectorAccessor for FlakySectors {
        async fn is_unsealed(
            &self,
            sector_id: SectorNumber,
            _: UnpaddedPieceSize,
            _: UnpaddedPieceSize,
        ) -> Result<bool, DealError> {
            Ok(self.unsealed.contains(&sector_id))
        }

        async fn unseal_sector(
            &self,
            sector_id: SectorNumber,
            _: UnpaddedPieceSize,
            _: UnpaddedPieceSize,
        ) -> Result<Vec<u8>, DealError> {
            self.calls.lock().unwrap().push(sector_id);
            if sector_id == 1 {
                return Err(DealError::illegal_state("sector 1 is corrupt".into()));
            }
            Ok(self.car.clone())
        }
    }

    fn deal(deal_id: u64, sector_id: u64) -> DealInfo {
        DealInfo { deal_id, sector_id, offset: PaddedPieceSize(0), length: PaddedPieceSize(1024) }
    }

    async fn setup(unsealed: Vec<SectorNumber>) -> (UnsealingLoader, Arc<FlakySectors>, Cid) {
        let block = raw_cid(b"payload").unwrap();
        let piece = raw_cid(b"piece").unwrap();
        let car = write_car(vec![block], vec![(block, b"payload".to_vec())]).await.unwrap();

        let pieces = Arc::new(MemoryPieceStore::new());
        pieces.add_deal_for_piece(piece, deal(1, 1)).unwrap();
        pieces.add_deal_for_piece(piece, deal(2, 2)).unwrap();
        pieces
            .add_piece_block_locations(piece, BTreeMap::from([(block, BlockLocation { rel_offset: 0, block_size: 7 })]))
            .unwrap();

        let sectors = Arc::new(FlakySectors { car, unsealed, calls: StdMutex::new(Vec::new()) });
        let loader = UnsealingLoader::new(MemoryBlockstore::shared(), pieces, sectors.clone());
        (loader, sectors, block)
    }

    #[tokio::test]
    async fn falls_back_to_next_sector() {
        let (loader, sectors, block) = setup(vec![]).await;
        assert_eq!(loader.load(&block).await.unwrap(), b"payload");
        assert_eq!(*sectors.calls.lock().unwrap(), vec![1, 2]);

        // Cached now.
        assert_eq!(loader.load(&block).await.unwrap(), b"payload");
        assert_eq!(sectors.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn piece_locks_are_dropped_after_unsealing() {
        let (loader, _, block) = setup(vec![]).await;
        let loader = Arc::new(loader);
        let loads: Vec<_> = (0..4)
            .map(|_| {
                let loader = loader.clone();
                tokio::spawn(async move { loader.load(&block).await })
            })
            .collect();
        for load in loads {
            assert_eq!(load.await.unwrap().unwrap(), b"payload");
        }
        assert!(loader.locks.lock().await.is_empty());

        let err = loader.load(&raw_cid(b"elsewhere").unwrap()).await.unwrap_err();
        assert!(err.msg().starts_with("error looking up information on CID"));
        assert!(loader.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn prefers_already_unsealed_sectors() {
        let (loader, sectors, block) = setup(vec![2]).await;
        loader.load(&block).await.unwrap();
        assert_eq!(*sectors.calls.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn unknown_blocks_and_empty_pieces_fail() {
        let (loader, _, _) = setup(vec![]).await;
        let err = loader.load(&raw_cid(b"elsewhere").unwrap()).await.unwrap_err();
        assert!(err.msg().starts_with("error looking up information on CID"));

        let empty = PieceInfo { piece_cid: raw_cid(b"p").unwrap(), deals: vec![] };
        let sectors = FlakySectors { car: vec![], unsealed: vec![], calls: StdMutex::new(vec![]) };
        let err = first_successful_unseal(&empty, &sectors).await.unwrap_err();
        assert_eq!(err.msg(), "no sectors found to unseal from");
    }

    #[tokio::test]
    async fn all_sectors_failing_reports_last_error() {
        let piece = PieceInfo { piece_cid: raw_cid(b"p").unwrap(), deals: vec![deal(1, 1), deal(3, 1)] };
        let sectors = FlakySectors { car: vec![], unsealed: vec![], calls: StdMutex::new(vec![]) };
        let err = first_successful_unseal(&piece, &sectors).await.unwrap_err();
        assert_eq!(err.msg(), "sector 1 is corrupt");
        assert_eq!(sectors.calls.lock().unwrap().len(), 2);
    }
}
