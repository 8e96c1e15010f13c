pub mod archive;
pub mod audit;
pub mod clock;
pub mod compress;
pub mod config;
pub mod download;
pub mod feeds;
pub mod filter;
pub mod fs;
pub mod paths;
pub mod retention;
pub mod runlog;
pub mod schema;
pub mod store;
#[cfg(test)]
pub mod testkit;
pub mod timefmt;
pub mod transport;
pub mod warn;
pub mod watermark;
