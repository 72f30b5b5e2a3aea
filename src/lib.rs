pub mod cloning;
pub mod config;
pub mod error;
pub mod models;
pub mod observer;
pub mod pool;
pub mod provision;
pub mod registry;
pub mod reload;
pub mod runner;
pub mod thinclone;
