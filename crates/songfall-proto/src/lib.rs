pub mod config;
pub mod platform;
pub mod protocol;
pub mod source;
pub mod state;
