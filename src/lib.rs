pub mod canned;
pub mod chat;
pub mod constants;
pub mod db;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod relay;
pub mod routes;
pub mod specs;
pub mod sse;
pub mod types;
pub mod upstream;

pub use types::*;

pub use main_helper::{AppState, Args};
