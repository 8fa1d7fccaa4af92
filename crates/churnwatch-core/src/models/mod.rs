//! Data models for churnwatch

mod alert;
mod channel;
mod digest;
mod event;

pub use alert::*;
pub use channel::*;
pub use digest::*;
pub use event::*;
