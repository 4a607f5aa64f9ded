pub mod app;
pub mod batch;
pub mod config;
pub mod dedup;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod naming;
pub mod output;
pub mod pool;
pub mod probe;
pub mod search;
pub mod store;
pub mod transfer;
pub mod verify;
pub mod worker;
