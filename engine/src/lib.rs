#![recursion_limit = "512"]

pub mod config;
pub mod context;
pub mod db;
pub mod db_helpers;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod events;
pub mod handlers;
pub mod heartbeat;
pub mod identity_lock;
pub mod keystore;
pub mod lifecycle;
pub mod listener_manager;
pub mod registry;
pub mod send_queue;
pub mod stabilization;
pub mod task_queue;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use events::Event;
