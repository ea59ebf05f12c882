// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use cid::Cid;

use crate::piecestore::PieceStore;
use crate::unsealing::{first_successful_unseal, SectorAccessor};
use crate::{deal_error, DealContext, DealError};

pub const LOTUS_SCHEME: &str = "lotus";

/// Size and presence of a mounted piece.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MountStat {
    pub exists: bool,
    pub size: u64,
}

/// Exposes one piece as a shard that can be fetched in full, unsealing it if needed.
/// Addressed as `lotus://<piece cid>`.
#[derive(Clone)]
pub struct PieceMount {
    piece_cid: Cid,
    pieces: Arc<dyn PieceStore>,
    accessor: Arc<dyn SectorAccessor>,
}

impl PieceMount {
    pub fn new(piece_cid: Cid, pieces: Arc<dyn PieceStore>, accessor: Arc<dyn SectorAccessor>) -> Self {
        Self { piece_cid, pieces, accessor }
    }

    pub fn piece_cid(&self) -> &Cid {
        &self.piece_cid
    }

    pub fn serialize(&self) -> String {
        format!("{}://{}", LOTUS_SCHEME, self.piece_cid)
    }

    /// Points a mount template at the piece named by `url`.
    pub fn deserialize(&self, url: &str) -> Result<Self, DealError> {
        let (scheme, host) = url
            .split_once("://")
            .ok_or_else(|| deal_error!(illegal_argument; "invalid mount URL '{}'", url))?;
        if scheme != LOTUS_SCHEME {
            return Err(deal_error!(illegal_argument;
                "scheme '{}' for URL '{}' does not match required scheme '{}'", scheme, url, LOTUS_SCHEME));
        }
        let piece_cid = Cid::try_from(host).map_err(
            |e| deal_error!(illegal_argument; "failed to parse PieceCid from host '{}': {}", host, e),
        )?;
        Ok(Self { piece_cid, ..self.clone() })
    }

    /// Reads the whole unsealed piece.
    pub async fn fetch(&self) -> Result<Vec<u8>, DealError> {
        let info = self
            .pieces
            .get_piece_info(&self.piece_cid)
            .map_err(DealError::from)
            .with_context(|| format!("failed to fetch pieceInfo for piece {}", self.piece_cid))?;
        if info.deals.is_empty() {
            return Err(deal_error!(not_found; "no storage deals found for piece {}", self.piece_cid));
        }
        first_successful_unseal(&info, self.accessor.as_ref())
            .await
            .with_context(|| format!("failed to fetch unsealed piece {}", self.piece_cid))
    }

    /// Unpadded size of the piece, taken from the first deal storing it.
    pub async fn stat(&self) -> Result<MountStat, DealError> {
        let info = self
            .pieces
            .get_piece_info(&self.piece_cid)
            .map_err(DealError::from)
            .with_context(|| format!("failed to fetch pieceInfo for piece {}", self.piece_cid))?;
        let first = info
            .deals
            .first()
            .ok_or_else(|| deal_error!(not_found; "no storage deals found for piece {}", self.piece_cid))?;
        Ok(MountStat { exists: true, size: first.length.unpadded().0 })
    }
}
