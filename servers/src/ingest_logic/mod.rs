pub mod activity;
pub mod config;
pub mod feed;
pub mod logger;
pub mod monitor;
