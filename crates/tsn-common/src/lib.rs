#![doc = "Common types shared across the TSN pub/sub workspace."]

pub mod config;
pub mod error;
pub mod time;

pub use config::*;
pub use error::*;
pub use time::*;
