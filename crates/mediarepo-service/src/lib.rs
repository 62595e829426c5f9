#[macro_use]
pub mod metrics;

pub mod caching;
pub mod coalescing;
pub mod config;
pub mod controllers;
pub mod handler;
pub mod logging;
pub mod pool;
pub mod services;
pub mod storage;
pub mod types;
pub mod utils;
