pub mod config;
pub mod conflate;
pub mod error;
pub mod geometry;
pub mod increment;
pub mod io;
pub mod metadata;
pub mod network;
pub mod pipeline;
pub mod record;
pub mod run_order;
pub mod scoring;
pub mod solver;

pub use config::Settings;
pub use error::{ConflateError, Result};
