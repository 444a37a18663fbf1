pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod protocol;

pub use config::Config;
pub use error::{Error, Result};
