// Bundle updater engine - core module structure
pub mod cli;
pub mod config;
pub mod locks;
pub mod platform;
pub mod updater;

pub use config::UpdaterConfig;
