//! HTTP request handlers.

pub mod common;
pub mod downloads;
pub mod health;
pub mod uploads;

pub use common::*;
pub use downloads::*;
pub use health::*;
pub use uploads::*;
