pub mod api;
pub mod artifacts;
pub mod checksum;
pub mod clock;
pub mod config;
pub mod error;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod shutdown;
pub mod store;

pub use error::{PrecheckError, Result};
