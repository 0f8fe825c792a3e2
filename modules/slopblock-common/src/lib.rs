pub mod config;
pub mod error;
pub mod types;

pub use config::{load_filter_config, AppConfig, FilterConfig, HeuristicConfig};
pub use error::SlopBlockError;
pub use types::*;
