//! Configuration: a TOML file plus command-line overrides

mod loader;
mod schema;

pub use loader::{load_config, parse_config};
pub use schema::*;
