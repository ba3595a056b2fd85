pub mod config;
pub mod session;

pub use config::*;
