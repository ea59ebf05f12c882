// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::multihash::Multihash;
use cid::Cid;
use fvm_shared::piece::PaddedPieceSize;
use sha2::{Digest, Sha256};

use crate::util::cid::{FIL_COMMITMENT_UNSEALED, SHA2_256_TRUNC254_PADDED};
use crate::{deal_error, DealError};

const NODE_SIZE: usize = 32;
const MIN_PIECE_SIZE: u64 = 128;

/// Smallest padded piece size whose unpadded capacity (127/128ths) holds `len` bytes.
pub fn padded_size_for(len: u64) -> PaddedPieceSize {
    let mut size = MIN_PIECE_SIZE;
    while size / 128 * 127 < len {
        size <<= 1;
    }
    PaddedPieceSize(size)
}

fn hash_pair(left: &[u8], right: &[u8]) -> [u8; NODE_SIZE] {
    let mut h = Sha256::new();
    h.update(left);
    h.update(right);
    let mut out: [u8; NODE_SIZE] = h.finalize().into();
    // Field elements keep 254 bits.
    out[NODE_SIZE - 1] &= 0b0011_1111;
    out
}

/// Computes the unsealed piece commitment of `data`, zero-padded to its padded piece size.
pub fn generate_piece_commitment(data: &[u8]) -> Result<(Cid, PaddedPieceSize), DealError> {
    let size = padded_size_for(data.len() as u64);
    let mut padded = data.to_vec();
    padded.resize(size.0 as usize, 0);

    let mut layer: Vec<[u8; NODE_SIZE]> = padded
        .chunks(NODE_SIZE)
        .map(|c| {
            let mut leaf = [0u8; NODE_SIZE];
            leaf.copy_from_slice(c);
            leaf[NODE_SIZE - 1] &= 0b0011_1111;
            leaf
        })
        .collect();
    while layer.len() > 1 {
        layer = layer.chunks(2).map(|pair| hash_pair(&pair[0], &pair[1])).collect();
    }
    let root = layer.first().ok_or_else(|| deal_error!(illegal_state; "empty piece tree"))?;
    Ok((commitment_to_cid(root)?, size))
}

/// Wraps a raw 32-byte commitment as a piece CID.
pub fn commitment_to_cid(commitment: &[u8]) -> Result<Cid, DealError> {
    if commitment.len() != NODE_SIZE {
        return Err(deal_error!(illegal_argument; "commitment must be 32 bytes, got {}", commitment.len()));
    }
    let mh = Multihash::wrap(SHA2_256_TRUNC254_PADDED, commitment)
        .map_err(|e| deal_error!(illegal_argument; "invalid commitment: {}", e))?;
    Ok(Cid::new_v1(FIL_COMMITMENT_UNSEALED, mh))
}
