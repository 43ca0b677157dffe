//! Discord integration: REST posting and the interactions webhook.

pub mod interactions;
pub mod poster;

pub use interactions::{serve, InteractionState};
pub use poster::{DiscordPoster, PostError, Poster};

/// Discord REST API base, pinned to one version so payload shapes stay
/// stable.
pub const DISCORD_API_URL: &str = "https://discord.com/api/v10";
