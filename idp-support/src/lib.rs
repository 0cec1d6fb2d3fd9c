#![allow(clippy::new_without_default)]

pub mod config;
pub mod error;
pub mod logging;
pub mod time;

pub use config::NetworkConfig;
pub use error::{ErrorKind, ErrorUtils, IdpResult};
pub use time::{Clock, SystemClock, TestClock};
