//! Type definitions

pub mod domain;
pub mod job;
pub mod messages;

pub use domain::*;
pub use job::*;
pub use messages::*;
