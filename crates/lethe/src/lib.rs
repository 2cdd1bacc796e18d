#![doc = include_str!("../README.md")]

pub use lethe_core as core;
pub use lethe_device as device;
pub use lethe_session as session;

pub use thiserror;

pub mod prelude {
    pub use lethe_session::prelude::*;
}
