//! Shared message model and cache record format for `chatsync`.

pub mod codec;
pub mod message;
