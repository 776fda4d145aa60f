//! Reads OpenSSH client configs, tells connectable hosts apart from pattern
//! rules, resolves effective settings through the installed `ssh`, and edits
//! the config in place without disturbing anything it doesn't touch.

pub mod connection;
pub mod engine;
pub mod logging;
pub mod preferences;
pub mod ssh_config;

pub use engine::{ConfigEngine, EngineOptions};
