use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::graphs::ChartKind;
use crate::scheduler::policy::UpdatePolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    pub tautulli: TautulliConfig,

    pub discord: DiscordConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub graphs: GraphsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TautulliConfig {
    /// Base URL of the Tautulli instance, e.g. `http://tautulli:8181`.
    pub url: String,

    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub token: String,

    pub application_id: u64,

    /// Hex-encoded interactions public key from the developer portal.
    pub public_key: String,

    /// Channel scheduled chart posts go to.
    pub channel_id: u64,

    #[serde(default = "default_webhook_port")]
    pub webhook_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_state_file")]
    pub state_file: String,

    #[serde(default = "default_policy")]
    pub policy: UpdatePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphsConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    #[serde(default = "default_time_range_days")]
    pub time_range_days: u32,

    /// Rendered files older than this many days are deleted after a run.
    #[serde(default = "default_keep_days")]
    pub keep_days: u32,

    #[serde(default = "default_censor_usernames")]
    pub censor_usernames: bool,

    #[serde(default = "default_render_timeout_secs")]
    pub render_timeout_secs: u64,

    #[serde(default = "default_enabled_charts")]
    pub enabled: Vec<ChartKind>,

    #[serde(default)]
    pub colors: ColorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorConfig {
    #[serde(default = "default_tv_color")]
    pub tv: String,

    #[serde(default = "default_movie_color")]
    pub movie: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_webhook_port() -> u16 {
    8700
}

fn default_state_file() -> String {
    "data/schedule_state.json".to_string()
}

fn default_policy() -> UpdatePolicy {
    UpdatePolicy::Interval { days: 7 }
}

fn default_output_dir() -> String {
    "data/graphs".to_string()
}

fn default_time_range_days() -> u32 {
    30
}

fn default_keep_days() -> u32 {
    7
}

fn default_censor_usernames() -> bool {
    true
}

fn default_render_timeout_secs() -> u64 {
    60
}

fn default_enabled_charts() -> Vec<ChartKind> {
    ChartKind::ALL.to_vec()
}

fn default_tv_color() -> String {
    "#1f77b4".to_string()
}

fn default_movie_color() -> String {
    "#ff7f0e".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            policy: default_policy(),
        }
    }
}

impl Default for GraphsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            time_range_days: default_time_range_days(),
            keep_days: default_keep_days(),
            censor_usernames: default_censor_usernames(),
            render_timeout_secs: default_render_timeout_secs(),
            enabled: default_enabled_charts(),
            colors: ColorConfig::default(),
        }
    }
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            tv: default_tv_color(),
            movie: default_movie_color(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("could not parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.scheduler.policy.validate()?;

        if self.tautulli.url.is_empty() {
            anyhow::bail!("tautulli.url must be set");
        }
        if self.tautulli.api_key.is_empty() {
            anyhow::bail!("tautulli.api_key must be set");
        }
        if self.discord.token.is_empty() {
            anyhow::bail!("discord.token must be set");
        }
        if self.discord.public_key.is_empty() {
            anyhow::bail!("discord.public_key must be set");
        }
        if self.graphs.enabled.is_empty() {
            anyhow::bail!("graphs.enabled must list at least one chart");
        }
        if self.graphs.time_range_days < 1 {
            anyhow::bail!("graphs.time_range_days must be at least 1");
        }
        if self.graphs.keep_days < 1 {
            anyhow::bail!("graphs.keep_days must be at least 1");
        }
        if self.graphs.render_timeout_secs < 1 {
            anyhow::bail!("graphs.render_timeout_secs must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [tautulli]
        url = "http://tautulli:8181"
        api_key = "abc123"

        [discord]
        token = "bot-token"
        application_id = 1234
        public_key = "00ff"
        channel_id = 42
    "#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.log_level, "info");
        assert_eq!(config.discord.webhook_port, 8700);
        assert_eq!(config.scheduler.state_file, "data/schedule_state.json");
        assert_eq!(config.scheduler.policy, UpdatePolicy::Interval { days: 7 });
        assert_eq!(config.graphs.time_range_days, 30);
        assert_eq!(config.graphs.keep_days, 7);
        assert!(config.graphs.censor_usernames);
        assert_eq!(config.graphs.enabled.len(), 6);
        assert_eq!(config.graphs.colors.tv, "#1f77b4");
        assert_eq!(config.graphs.colors.movie, "#ff7f0e");
    }

    #[test]
    fn test_full_config_parses() {
        let toml = r##"
            log_level = "debug"

            [tautulli]
            url = "http://tautulli:8181/"
            api_key = "abc123"

            [discord]
            token = "bot-token"
            application_id = 1234
            public_key = "00ff"
            channel_id = 42
            webhook_port = 9000

            [scheduler]
            state_file = "/var/lib/tgraph/state.json"
            policy = { kind = "fixedTime", hour = 3, minute = 30 }

            [graphs]
            output_dir = "/var/lib/tgraph/graphs"
            time_range_days = 14
            keep_days = 3
            censor_usernames = false
            render_timeout_secs = 120
            enabled = ["daily_play_count", "top_10_users"]

            [graphs.colors]
            tv = "#003366"
            movie = "#cc6600"
        "##;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(
            config.scheduler.policy,
            UpdatePolicy::FixedTime { hour: 3, minute: 30 }
        );
        assert_eq!(
            config.graphs.enabled,
            vec![ChartKind::DailyPlayCount, ChartKind::Top10Users]
        );
        assert_eq!(config.graphs.colors.tv, "#003366");
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let toml = format!(
            "{MINIMAL}\n[scheduler]\npolicy = {{ kind = \"interval\", days = 0 }}\n"
        );
        let config: Config = toml::from_str(&toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_fixed_time_rejected() {
        let toml = format!(
            "{MINIMAL}\n[scheduler]\npolicy = {{ kind = \"fixedTime\", hour = 24, minute = 0 }}\n"
        );
        let config: Config = toml::from_str(&toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_chart_list_rejected() {
        let toml = format!("{MINIMAL}\n[graphs]\nenabled = []\n");
        let config: Config = toml::from_str(&toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_required_section_fails() {
        let toml = r#"
            [tautulli]
            url = "http://tautulli:8181"
            api_key = "abc123"
        "#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }
}
