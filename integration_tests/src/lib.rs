use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use lazy_static::lazy_static;

pub mod tests;
pub mod util;

pub const CLIENT_PEER: &str = "client";
pub const PROVIDER_PEER: &str = "provider";

// chain epochs for deals made by the scenarios
pub const GENESIS_HEAD: ChainEpoch = 10;
pub const DEAL_START: ChainEpoch = 100;
pub const DEAL_END: ChainEpoch = 10_100;

pub const STORAGE_PRICE_PER_EPOCH: u64 = 20_000;
pub const PROVIDER_COLLATERAL: u64 = 1_000;
pub const RETRIEVAL_PRICE_PER_BYTE: u64 = 2;
pub const PAYMENT_INTERVAL: u64 = 4096;
pub const PAYMENT_INTERVAL_INCREASE: u64 = 1024;

lazy_static! {
    pub static ref CLIENT_WALLET: Address = Address::new_id(1000);
    pub static ref MINER_ADDR: Address = Address::new_id(2000);
    pub static ref WORKER_ADDR: Address = Address::new_id(2001);
    pub static ref PAYMENT_CHANNEL: Address = Address::new_id(3000);
}
