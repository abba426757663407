//! Test doubles and fixture messages for herald.

mod message;
mod mock;

pub use message::*;
pub use mock::*;
