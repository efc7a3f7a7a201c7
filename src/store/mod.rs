mod client;

pub use client::{KvStore, StreamEntry, Txn};
