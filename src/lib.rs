pub mod adaptive;
pub mod assertions;
pub mod checkers;
pub mod config;
pub mod db;
pub mod diffing;
pub mod error;
pub mod heartbeat;
pub mod incidents;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod pool;
pub mod processor;
pub mod registry;
pub mod retention;
pub mod safedial;
pub mod scheduler;
pub mod totp;

pub use config::Config;
pub use db::Store;
pub use error::{Error, Result};
pub use pipeline::{Pipeline, PipelineHandle};
