// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::{Cid, Version};

use crate::util::cid::cid_of;
use crate::{deal_error, DealError};

/// Everything in a CID except the digest. Sent alongside block data so the receiver can
/// rebuild the CID by hashing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockPrefix {
    pub version: u64,
    pub codec: u64,
    pub mh_type: u64,
    pub mh_len: u64,
}

impl BlockPrefix {
    pub fn of(cid: &Cid) -> Self {
        Self {
            version: u64::from(cid.version()),
            codec: cid.codec(),
            mh_type: cid.hash().code(),
            mh_len: u64::from(cid.hash().size()),
        }
    }

    /// Four unsigned varints: version, codec, multihash code, digest length.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        for v in [self.version, self.codec, self.mh_type, self.mh_len] {
            let mut buf = unsigned_varint::encode::u64_buffer();
            out.extend_from_slice(unsigned_varint::encode::u64(v, &mut buf));
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DealError> {
        let mut rest = bytes;
        let mut fields = [0u64; 4];
        for field in fields.iter_mut() {
            let (v, remaining) = unsigned_varint::decode::u64(rest)
                .map_err(|e| deal_error!(serialization; "invalid block prefix: {}", e))?;
            *field = v;
            rest = remaining;
        }
        if !rest.is_empty() {
            return Err(deal_error!(serialization; "trailing bytes after block prefix"));
        }
        let [version, codec, mh_type, mh_len] = fields;
        Ok(Self { version, codec, mh_type, mh_len })
    }

    /// Hashes `data` into the CID this prefix describes.
    pub fn sum(&self, data: &[u8]) -> Result<Cid, DealError> {
        let cid = cid_of(self.codec, self.mh_type, data)?;
        if u64::from(cid.hash().size()) != self.mh_len {
            return Err(deal_error!(illegal_argument;
                "digest length {} does not match prefix length {}", cid.hash().size(), self.mh_len));
        }
        match Version::try_from(self.version) {
            Ok(Version::V1) => Ok(cid),
            Ok(Version::V0) => Cid::new_v0(*cid.hash())
                .map_err(|e| deal_error!(illegal_argument; "invalid v0 block: {}", e)),
            Err(e) => Err(deal_error!(illegal_argument; "invalid cid version {}: {}", self.version, e)),
        }
    }
}
