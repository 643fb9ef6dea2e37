// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Daily artifact and embedding models.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One generated image for one (user, date) pair.
///
/// At most one exists per pair; the document ID is [`DailyArtifact::doc_id`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyArtifact {
    pub user_id: String,
    /// Calendar date in the run's reference timezone
    pub date: NaiveDate,
    pub object_key: String,
    /// When the image was generated (RFC3339)
    pub generated_at: String,
    /// Set once the email went out
    #[serde(default)]
    pub delivered_at: Option<String>,
    /// Last delivery failure; the artifact is kept either way
    #[serde(default)]
    pub delivery_error: Option<String>,
}

impl DailyArtifact {
    pub fn doc_id(user_id: &str, date: NaiveDate) -> String {
        format!("{}_{}", urlencoding::encode(user_id), date.format("%Y-%m-%d"))
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }
}

/// Face embedding produced by the extraction capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Bounding box of the detected face: [x1, y1, x2, y2]
    pub bbox: [f32; 4],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_is_per_user_and_date() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 9).unwrap();
        assert_eq!(DailyArtifact::doc_id("abc", date), "abc_2026-02-09");
        assert_eq!(DailyArtifact::doc_id("a/b", date), "a%2Fb_2026-02-09");
    }

    #[test]
    fn date_serializes_as_iso() {
        let artifact = DailyArtifact {
            user_id: "u".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 2, 9).unwrap(),
            object_key: "generated/2026-02-09/u.png".to_string(),
            generated_at: "2026-02-09T06:00:00Z".to_string(),
            delivered_at: None,
            delivery_error: None,
        };
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["date"], "2026-02-09");
        assert!(!artifact.is_delivered());
    }
}
