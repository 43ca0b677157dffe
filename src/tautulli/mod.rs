//! Tautulli `/api/v2` client and payload types.

pub mod client;
pub mod types;

pub use client::TautulliClient;
