//! Discord bot that turns Tautulli watch history into charts and posts
//! them to a channel on a schedule.

pub mod config;
pub mod discord;
pub mod graphs;
pub mod logging;
pub mod scheduler;
pub mod tautulli;
