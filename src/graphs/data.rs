//! Play-history records and the per-chart aggregations over them.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use thiserror::Error;

const MONTH_ABBR: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

const WEEKDAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("tautulli request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("tautulli api reported an error: {0}")]
    Api(String),

    #[error("unexpected tautulli response: {0}")]
    InvalidResponse(String),
}

impl FetchError {
    /// Transport hiccups are worth another attempt, API rejections are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transport(_))
    }
}

/// A user as Tautulli knows them, resolved for stats commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUser {
    pub user_id: u64,
    pub username: String,
}

/// Source of play history. Implemented by the Tautulli client; tests use
/// canned histories.
#[async_trait]
pub trait DataFetcher: Send + Sync {
    async fn fetch(&self, range_days: u32) -> Result<PlayHistory, FetchError>;

    async fn fetch_for_user(
        &self,
        range_days: u32,
        user_id: u64,
    ) -> Result<PlayHistory, FetchError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<ResolvedUser>, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Movie,
    Tv,
    Music,
    Other,
}

impl MediaKind {
    pub fn from_tautulli(media_type: &str) -> Self {
        match media_type {
            "movie" => MediaKind::Movie,
            "episode" => MediaKind::Tv,
            "track" => MediaKind::Music,
            _ => MediaKind::Other,
        }
    }
}

/// One watched item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayRecord {
    pub watched_at: DateTime<Utc>,
    pub user_id: u64,
    pub user: String,
    pub platform: String,
    pub media: MediaKind,
}

/// All plays inside a closed date range, the unit every chart aggregates.
#[derive(Debug, Clone)]
pub struct PlayHistory {
    pub range_days: u32,
    pub range_end: DateTime<Utc>,
    pub records: Vec<PlayRecord>,
}

/// Per-bucket counts split into the two series every stacked chart shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSeries {
    pub labels: Vec<String>,
    pub movies: Vec<u32>,
    pub tv: Vec<u32>,
}

impl SplitSeries {
    pub fn total(&self) -> u32 {
        self.movies.iter().sum::<u32>() + self.tv.iter().sum::<u32>()
    }
}

/// Labelled counts ordered by rank, for the top-N charts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedSeries {
    pub labels: Vec<String>,
    pub counts: Vec<u32>,
}

impl RankedSeries {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl PlayHistory {
    /// Keeps only records inside `[range_end - range_days, range_end]`.
    pub fn new(range_days: u32, range_end: DateTime<Utc>, records: Vec<PlayRecord>) -> Self {
        let start = range_end - Duration::days(i64::from(range_days));
        let records = records
            .into_iter()
            .filter(|r| r.watched_at >= start && r.watched_at <= range_end)
            .collect();
        Self {
            range_days,
            range_end,
            records,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn range_start(&self) -> DateTime<Utc> {
        self.range_end - Duration::days(i64::from(self.range_days))
    }

    fn split_counts<K: Ord>(
        &self,
        bucket: impl Fn(&PlayRecord) -> K,
    ) -> BTreeMap<K, (u32, u32)> {
        let mut counts: BTreeMap<K, (u32, u32)> = BTreeMap::new();
        for record in &self.records {
            let entry = counts.entry(bucket(record)).or_default();
            match record.media {
                MediaKind::Movie => entry.0 += 1,
                MediaKind::Tv => entry.1 += 1,
                _ => {}
            }
        }
        counts
    }

    /// Movie/TV counts per calendar day. Days without plays still get a
    /// bucket so the time axis has no gaps.
    pub fn daily_play_counts(&self) -> SplitSeries {
        let counts = self.split_counts(|r| r.watched_at.date_naive());

        let mut labels = Vec::new();
        let mut movies = Vec::new();
        let mut tv = Vec::new();
        let mut day = self.range_start().date_naive();
        let last = self.range_end.date_naive();
        while day <= last {
            let (m, t) = counts.get(&day).copied().unwrap_or((0, 0));
            labels.push(day.format("%Y-%m-%d").to_string());
            movies.push(m);
            tv.push(t);
            day += Duration::days(1);
        }
        SplitSeries { labels, movies, tv }
    }

    pub fn plays_by_weekday(&self) -> SplitSeries {
        let counts =
            self.split_counts(|r| r.watched_at.weekday().num_days_from_monday() as usize);

        let mut movies = vec![0; 7];
        let mut tv = vec![0; 7];
        for (idx, (m, t)) in counts {
            if idx < 7 {
                movies[idx] = m;
                tv[idx] = t;
            }
        }
        SplitSeries {
            labels: WEEKDAY_NAMES.iter().map(|s| s.to_string()).collect(),
            movies,
            tv,
        }
    }

    pub fn plays_by_hour(&self) -> SplitSeries {
        let counts = self.split_counts(|r| r.watched_at.hour() as usize);

        let mut movies = vec![0; 24];
        let mut tv = vec![0; 24];
        for (idx, (m, t)) in counts {
            if idx < 24 {
                movies[idx] = m;
                tv[idx] = t;
            }
        }
        SplitSeries {
            labels: (0..24).map(|h| format!("{h:02}")).collect(),
            movies,
            tv,
        }
    }

    /// Movie/TV counts per calendar month intersecting the range.
    pub fn plays_by_month(&self) -> SplitSeries {
        let counts = self.split_counts(|r| (r.watched_at.year(), r.watched_at.month()));

        let mut labels = Vec::new();
        let mut movies = Vec::new();
        let mut tv = Vec::new();
        let start = self.range_start();
        let (mut year, mut month) = (start.year(), start.month());
        let end_key = (self.range_end.year(), self.range_end.month());
        while (year, month) <= end_key {
            let (m, t) = counts.get(&(year, month)).copied().unwrap_or((0, 0));
            let name = MONTH_ABBR.get(month as usize - 1).copied().unwrap_or("?");
            labels.push(format!("{name} {year}"));
            movies.push(m);
            tv.push(t);
            if month == 12 {
                year += 1;
                month = 1;
            } else {
                month += 1;
            }
        }
        SplitSeries { labels, movies, tv }
    }

    pub fn top_platforms(&self, limit: usize) -> RankedSeries {
        let mut counts: HashMap<&str, u32> = HashMap::new();
        for record in &self.records {
            *counts.entry(record.platform.as_str()).or_default() += 1;
        }
        Self::ranked(
            counts
                .into_iter()
                .map(|(name, n)| (name.to_string(), n))
                .collect(),
            limit,
        )
    }

    /// Most active users. With `censor` set, names are replaced by their
    /// rank position so the chart can be posted publicly.
    pub fn top_users(&self, limit: usize, censor: bool) -> RankedSeries {
        let mut counts: HashMap<u64, (String, u32)> = HashMap::new();
        for record in &self.records {
            let entry = counts
                .entry(record.user_id)
                .or_insert_with(|| (record.user.clone(), 0));
            entry.1 += 1;
        }
        let mut series = Self::ranked(counts.into_values().collect(), limit);
        if censor {
            series.labels = (1..=series.labels.len())
                .map(|rank| format!("User {rank}"))
                .collect();
        }
        series
    }

    fn ranked(mut entries: Vec<(String, u32)>, limit: usize) -> RankedSeries {
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(limit);
        RankedSeries {
            labels: entries.iter().map(|(name, _)| name.clone()).collect(),
            counts: entries.iter().map(|(_, n)| *n).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    fn play(watched_at: DateTime<Utc>, user: &str, platform: &str, media: MediaKind) -> PlayRecord {
        let user_id = user.bytes().map(u64::from).sum();
        PlayRecord {
            watched_at,
            user_id,
            user: user.to_string(),
            platform: platform.to_string(),
            media,
        }
    }

    #[test]
    fn test_media_kind_mapping() {
        assert_eq!(MediaKind::from_tautulli("movie"), MediaKind::Movie);
        assert_eq!(MediaKind::from_tautulli("episode"), MediaKind::Tv);
        assert_eq!(MediaKind::from_tautulli("track"), MediaKind::Music);
        assert_eq!(MediaKind::from_tautulli("clip"), MediaKind::Other);
    }

    #[test]
    fn test_history_drops_records_outside_range() {
        let end = at(2024, 3, 31, 12);
        let history = PlayHistory::new(
            7,
            end,
            vec![
                play(at(2024, 3, 30, 10), "ann", "Roku", MediaKind::Movie),
                play(at(2024, 3, 1, 10), "ann", "Roku", MediaKind::Movie),
                play(at(2024, 4, 2, 10), "ann", "Roku", MediaKind::Movie),
            ],
        );
        assert_eq!(history.records.len(), 1);
    }

    #[test]
    fn test_daily_counts_pad_empty_days() {
        let end = at(2024, 3, 10, 12);
        let history = PlayHistory::new(
            3,
            end,
            vec![
                play(at(2024, 3, 9, 10), "ann", "Roku", MediaKind::Movie),
                play(at(2024, 3, 9, 11), "bob", "Web", MediaKind::Tv),
                play(at(2024, 3, 9, 12), "bob", "Web", MediaKind::Tv),
            ],
        );

        let series = history.daily_play_counts();
        assert_eq!(series.labels.len(), 4);
        assert_eq!(series.labels[0], "2024-03-07");
        assert_eq!(series.movies, vec![0, 0, 1, 0]);
        assert_eq!(series.tv, vec![0, 0, 2, 0]);
        assert_eq!(series.total(), 3);
    }

    #[test]
    fn test_weekday_counts_use_monday_first() {
        // 2024-03-04 is a Monday.
        let end = at(2024, 3, 10, 23);
        let history = PlayHistory::new(
            7,
            end,
            vec![
                play(at(2024, 3, 4, 10), "ann", "Roku", MediaKind::Movie),
                play(at(2024, 3, 10, 10), "ann", "Roku", MediaKind::Tv),
            ],
        );

        let series = history.plays_by_weekday();
        assert_eq!(series.labels[0], "Monday");
        assert_eq!(series.movies[0], 1);
        assert_eq!(series.tv[6], 1);
    }

    #[test]
    fn test_hourly_counts_have_24_buckets() {
        let end = at(2024, 3, 10, 23);
        let history = PlayHistory::new(
            1,
            end,
            vec![
                play(at(2024, 3, 10, 0), "ann", "Roku", MediaKind::Movie),
                play(at(2024, 3, 10, 23), "ann", "Roku", MediaKind::Tv),
            ],
        );

        let series = history.plays_by_hour();
        assert_eq!(series.labels.len(), 24);
        assert_eq!(series.movies[0], 1);
        assert_eq!(series.tv[23], 1);
    }

    #[test]
    fn test_month_counts_span_year_boundary() {
        let end = at(2024, 1, 10, 12);
        let history = PlayHistory::new(
            30,
            end,
            vec![
                play(at(2023, 12, 20, 10), "ann", "Roku", MediaKind::Movie),
                play(at(2024, 1, 5, 10), "ann", "Roku", MediaKind::Tv),
            ],
        );

        let series = history.plays_by_month();
        assert_eq!(series.labels, vec!["Dec 2023", "Jan 2024"]);
        assert_eq!(series.movies, vec![1, 0]);
        assert_eq!(series.tv, vec![0, 1]);
    }

    #[test]
    fn test_top_platforms_ranked_and_truncated() {
        let end = at(2024, 3, 10, 12);
        let mut records = Vec::new();
        for _ in 0..3 {
            records.push(play(at(2024, 3, 9, 10), "ann", "Roku", MediaKind::Movie));
        }
        for _ in 0..5 {
            records.push(play(at(2024, 3, 9, 10), "ann", "Web", MediaKind::Tv));
        }
        records.push(play(at(2024, 3, 9, 10), "ann", "TV", MediaKind::Movie));
        let history = PlayHistory::new(7, end, records);

        let series = history.top_platforms(2);
        assert_eq!(series.labels, vec!["Web", "Roku"]);
        assert_eq!(series.counts, vec![5, 3]);
    }

    #[test]
    fn test_top_users_censoring_hides_names() {
        let end = at(2024, 3, 10, 12);
        let history = PlayHistory::new(
            7,
            end,
            vec![
                play(at(2024, 3, 9, 10), "ann", "Roku", MediaKind::Movie),
                play(at(2024, 3, 9, 11), "ann", "Roku", MediaKind::Movie),
                play(at(2024, 3, 9, 12), "bob", "Web", MediaKind::Tv),
            ],
        );

        let open = history.top_users(10, false);
        assert_eq!(open.labels, vec!["ann", "bob"]);
        assert_eq!(open.counts, vec![2, 1]);

        let censored = history.top_users(10, true);
        assert_eq!(censored.labels, vec!["User 1", "User 2"]);
        assert_eq!(censored.counts, vec![2, 1]);
    }

    #[test]
    fn test_music_counts_toward_ranks_but_not_split_series() {
        let end = at(2024, 3, 10, 12);
        let history = PlayHistory::new(
            7,
            end,
            vec![play(at(2024, 3, 9, 10), "ann", "Sonos", MediaKind::Music)],
        );

        assert_eq!(history.daily_play_counts().total(), 0);
        assert_eq!(history.top_platforms(10).counts, vec![1]);
    }
}
