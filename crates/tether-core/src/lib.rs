//! Configuration, bootstrap and built-in tools on top of `tether-tools`.

pub mod bootstrap;
pub mod builtin;
pub mod config;

pub use bootstrap::{AppBuilder, Runtime};
pub use config::{Config, LogFormat, LoggingConfig, resolve_config_path};
