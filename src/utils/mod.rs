//! Environment helpers shared by the config layer.

mod env;

pub use env::get_env_with_prefix;
