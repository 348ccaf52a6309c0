// src/lib.rs
pub mod ports {
    pub mod binance_futures;
    pub mod paper;
}
pub mod config;
pub mod email_client;
pub mod engine;
pub mod gateway;
pub mod ledger;
pub mod locks;
pub mod notifier;
pub mod server;
pub mod sizing;
