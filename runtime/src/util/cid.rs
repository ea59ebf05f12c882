// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::multihash::Multihash;
use cid::Cid;
use sha2::{Digest, Sha256};

use crate::{deal_error, DealError};

pub use fvm_ipld_encoding::{DAG_CBOR, IPLD_RAW};

/// Multihash code for the identity "hash".
pub const IDENTITY: u64 = 0x00;
/// Multihash code for sha2-256.
pub const SHA2_256: u64 = 0x12;
/// Multihash code for blake2b-256.
pub const BLAKE2B_256: u64 = 0xb220;
/// Multihash code for the truncated, padded sha2-256 used by piece commitments.
pub const SHA2_256_TRUNC254_PADDED: u64 = 0x1012;
/// Codec for unsealed piece commitments.
pub const FIL_COMMITMENT_UNSEALED: u64 = 0xf101;

/// Hashes `data` with the multihash function identified by `code`.
pub fn digest(code: u64, data: &[u8]) -> Result<Vec<u8>, DealError> {
    match code {
        IDENTITY => Ok(data.to_vec()),
        SHA2_256 => Ok(Sha256::digest(data).to_vec()),
        BLAKE2B_256 => {
            Ok(blake2b_simd::Params::new().hash_length(32).hash(data).as_bytes().to_vec())
        }
        _ => Err(deal_error!(illegal_argument; "unsupported multihash code {:#x}", code)),
    }
}

/// Computes the CIDv1 of `data` encoded with `codec`, hashed with `mh_code`.
pub fn cid_of(codec: u64, mh_code: u64, data: &[u8]) -> Result<Cid, DealError> {
    let hash = Multihash::wrap(mh_code, &digest(mh_code, data)?)
        .map_err(|e| deal_error!(illegal_argument; "failed to wrap digest: {}", e))?;
    Ok(Cid::new_v1(codec, hash))
}

/// Computes the CIDv1 of a DAG-CBOR block hashed with sha2-256.
pub fn cbor_cid(data: &[u8]) -> Result<Cid, DealError> {
    cid_of(DAG_CBOR, SHA2_256, data)
}

/// Computes the CIDv1 of a raw block hashed with sha2-256.
pub fn raw_cid(data: &[u8]) -> Result<Cid, DealError> {
    cid_of(IPLD_RAW, SHA2_256, data)
}

/// Checks that `data` hashes to the multihash embedded in `cid`.
pub fn verify_block(cid: &Cid, data: &[u8]) -> Result<(), DealError> {
    let expected = cid.hash();
    let actual = digest(expected.code(), data)?;
    if actual.as_slice() != expected.digest() {
        return Err(deal_error!(illegal_argument; "block data does not match cid {}", cid));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_matching_data() {
        let cid = raw_cid(b"foobar").unwrap();
        assert_eq!(cid.codec(), IPLD_RAW);
        assert!(verify_block(&cid, b"foobar").is_ok());
        assert!(verify_block(&cid, b"foobaz").is_err());
    }

    #[test]
    fn blake2b_cids_round_trip() {
        let cid = cid_of(DAG_CBOR, BLAKE2B_256, b"\x80").unwrap();
        assert_eq!(cid.hash().code(), BLAKE2B_256);
        assert_eq!(cid.hash().size(), 32);
        assert!(verify_block(&cid, b"\x80").is_ok());
    }

    #[test]
    fn unknown_hash_is_rejected() {
        assert!(digest(0x1b, b"x").is_err());
    }
}
