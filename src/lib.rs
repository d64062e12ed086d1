pub mod atomic;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod recovery;
pub mod storage;

pub use config::{CacheConfig, EngineConfig};
pub use engine::Engine;
