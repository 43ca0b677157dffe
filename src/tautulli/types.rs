//! Wire shapes for the Tautulli `/api/v2` endpoint.

use chrono::DateTime;
use serde::Deserialize;

use crate::graphs::data::{MediaKind, PlayRecord};

/// Every Tautulli response wraps its payload in this envelope.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub response: ApiResponse<T>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub result: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<T>,
}

/// `get_history` payload. Only the fields the charts need are kept.
#[derive(Debug, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub data: Vec<HistoryEntry>,
    #[serde(default, rename = "recordsFiltered")]
    pub records_filtered: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    /// Play start as a unix timestamp.
    #[serde(default)]
    pub date: i64,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub user_id: u64,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub media_type: String,
}

impl HistoryEntry {
    /// Convert to a chart record. Entries with timestamps outside the
    /// representable range are dropped.
    pub fn to_record(&self) -> Option<PlayRecord> {
        let watched_at = DateTime::from_timestamp(self.date, 0)?;
        Some(PlayRecord {
            watched_at,
            user_id: self.user_id,
            user: self.user.clone(),
            platform: self.platform.clone(),
            media: MediaKind::from_tautulli(&self.media_type),
        })
    }
}

/// One entry from `get_users`.
#[derive(Debug, Clone, Deserialize)]
pub struct TautulliUser {
    pub user_id: u64,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_envelope_parses() {
        let json = r#"{
            "response": {
                "result": "success",
                "message": null,
                "data": {
                    "recordsFiltered": 2,
                    "recordsTotal": 1000,
                    "data": [
                        {
                            "date": 1709921456,
                            "user": "ann",
                            "user_id": 123456,
                            "platform": "Roku",
                            "media_type": "movie",
                            "full_title": "Some Movie"
                        },
                        {
                            "date": 1709925056,
                            "user": "bob",
                            "user_id": 654321,
                            "platform": "Chrome",
                            "media_type": "episode"
                        }
                    ]
                }
            }
        }"#;

        let envelope: ApiEnvelope<HistoryPage> = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.response.result, "success");
        let page = envelope.response.data.unwrap();
        assert_eq!(page.records_filtered, 2);
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.data[0].user, "ann");
        assert_eq!(page.data[1].media_type, "episode");
    }

    #[test]
    fn test_error_envelope_parses() {
        let json = r#"{
            "response": {
                "result": "error",
                "message": "Invalid apikey",
                "data": {}
            }
        }"#;

        let envelope: ApiEnvelope<HistoryPage> = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.response.result, "error");
        assert_eq!(envelope.response.message.as_deref(), Some("Invalid apikey"));
    }

    #[test]
    fn test_user_list_tolerates_null_email() {
        let json = r#"[
            {"user_id": 1, "username": "ann", "email": "ann@example.com"},
            {"user_id": 2, "username": "bob", "email": null},
            {"user_id": 3, "username": "cleo"}
        ]"#;

        let users: Vec<TautulliUser> = serde_json::from_str(json).unwrap();
        assert_eq!(users.len(), 3);
        assert_eq!(users[0].email.as_deref(), Some("ann@example.com"));
        assert!(users[1].email.is_none());
        assert!(users[2].email.is_none());
    }

    #[test]
    fn test_history_entry_conversion() {
        let entry = HistoryEntry {
            date: 1709921456,
            user: "ann".to_string(),
            user_id: 7,
            platform: "Roku".to_string(),
            media_type: "movie".to_string(),
        };

        let record = entry.to_record().unwrap();
        assert_eq!(record.user, "ann");
        assert_eq!(record.media, MediaKind::Movie);
        assert_eq!(record.watched_at.timestamp(), 1709921456);
    }

    #[test]
    fn test_out_of_range_timestamp_dropped() {
        let entry = HistoryEntry {
            date: i64::MAX,
            user: String::new(),
            user_id: 0,
            platform: String::new(),
            media_type: String::new(),
        };
        assert!(entry.to_record().is_none());
    }
}
