//! In-memory room message state.
//!
//! [`RoomMessageState`] is the authoritative displayed list of one room plus
//! its loading, error and pagination fields. The controllers in
//! [`crate::sync`] own one per open room and publish it to observers.

pub mod state;

pub use state::{RoomMessageState, SyncPhase, dedupe_near_duplicates};
