//! Library crate for proxy-probe-rs: tests a list of URLs through a set of
//! proxies and publishes grouped results while the run is in progress.
pub mod aggregator;
pub mod blobstore;
pub mod browser;
pub mod config;
pub mod expand;
pub mod fetch;
pub mod proxy;
pub mod render;
pub mod runner;
pub mod server;
pub mod strategy;
pub mod types;
