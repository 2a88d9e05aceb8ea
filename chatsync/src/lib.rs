//! `chatsync`: message synchronization and local cache engine for chat rooms.

pub mod cache;
pub mod config;
pub mod gateway;
pub mod room;
pub mod sync;
