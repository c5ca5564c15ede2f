pub mod concurrent;
pub mod config;
pub mod ids;
pub mod logging;
