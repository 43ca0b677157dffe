//! Chart catalog, play-history aggregation, rendering and the update
//! orchestrator.

pub mod data;
pub mod orchestrator;
pub mod render;
pub mod runner;

use serde::{Deserialize, Serialize};

pub use data::{DataFetcher, FetchError, PlayHistory};
pub use orchestrator::UpdateOrchestrator;
pub use render::ChartRenderer;
pub use runner::{BlockingTaskRunner, RenderError, TaskError, TaskRunner};

/// Every chart the bot can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    DailyPlayCount,
    PlayCountByDayofweek,
    PlayCountByHourofday,
    PlayCountByMonth,
    #[serde(rename = "top_10_platforms")]
    Top10Platforms,
    #[serde(rename = "top_10_users")]
    Top10Users,
}

impl ChartKind {
    pub const ALL: [ChartKind; 6] = [
        ChartKind::DailyPlayCount,
        ChartKind::PlayCountByDayofweek,
        ChartKind::PlayCountByHourofday,
        ChartKind::PlayCountByMonth,
        ChartKind::Top10Platforms,
        ChartKind::Top10Users,
    ];

    /// Charts that make sense scoped to a single user's history.
    pub const PER_USER: [ChartKind; 4] = [
        ChartKind::DailyPlayCount,
        ChartKind::PlayCountByDayofweek,
        ChartKind::PlayCountByHourofday,
        ChartKind::PlayCountByMonth,
    ];

    /// Stable identifier used in file names and config.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartKind::DailyPlayCount => "daily_play_count",
            ChartKind::PlayCountByDayofweek => "play_count_by_dayofweek",
            ChartKind::PlayCountByHourofday => "play_count_by_hourofday",
            ChartKind::PlayCountByMonth => "play_count_by_month",
            ChartKind::Top10Platforms => "top_10_platforms",
            ChartKind::Top10Users => "top_10_users",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ChartKind::DailyPlayCount => "Daily Play Count",
            ChartKind::PlayCountByDayofweek => "Play Count by Day of Week",
            ChartKind::PlayCountByHourofday => "Play Count by Hour of Day",
            ChartKind::PlayCountByMonth => "Play Count by Month",
            ChartKind::Top10Platforms => "Top 10 Platforms",
            ChartKind::Top10Users => "Top 10 Users",
        }
    }
}

impl std::fmt::Display for ChartKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chart_kind_serde_names() {
        for kind in ChartKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            let back: ChartKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn test_per_user_is_subset_of_all() {
        for kind in ChartKind::PER_USER {
            assert!(ChartKind::ALL.contains(&kind));
        }
    }
}
