//! User model as stored by the web app and read by the batch run.

use chrono::Weekday;
use serde::{Deserialize, Serialize};

/// User profile stored in Firestore.
///
/// The web app owns this document; the batch run only writes
/// `embedding_object_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Opaque user ID (also used as document ID)
    pub id: String,
    pub email: String,
    /// Object key of the uploaded selfie
    #[serde(default)]
    pub selfie_object_key: Option<String>,
    /// Object key of the face embedding; `None` means extraction is pending
    #[serde(default)]
    pub embedding_object_key: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub workout_days: WorkoutDays,
    /// Prompt family ("shame", "toned", "ripped", "furry")
    #[serde(default)]
    pub mode: Option<String>,
    /// Pre-`mode` flag, consulted only when `mode` is unset
    #[serde(default)]
    pub anti_motivation_mode: Option<bool>,
}

impl User {
    /// Point the user at a new selfie.
    ///
    /// The embedding belongs to the previous selfie, so it is cleared in the
    /// same mutation and extraction runs again on the next workout day.
    pub fn replace_selfie(&mut self, selfie_object_key: impl Into<String>) {
        self.selfie_object_key = Some(selfie_object_key.into());
        self.embedding_object_key = None;
    }

    pub fn gender(&self) -> Gender {
        match self.gender.as_deref() {
            Some(g) if g.eq_ignore_ascii_case("female") => Gender::Female,
            _ => Gender::Male,
        }
    }

    /// Selected prompt family, with fallbacks for older profiles.
    pub fn mode(&self) -> Mode {
        match self.mode.as_deref() {
            Some(raw) => Mode::parse(raw),
            None if self.anti_motivation_mode == Some(true) => Mode::Shame,
            None => match self.gender() {
                Gender::Female => Mode::Toned,
                Gender::Male => Mode::Ripped,
            },
        }
    }

    pub fn stage(&self) -> UserStage {
        UserStage::from_user(self)
    }

    /// Case-insensitive email match used by the run's scope filter.
    pub fn matches_email(&self, email: &str) -> bool {
        self.email.trim().eq_ignore_ascii_case(email.trim())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gender {
    Male,
    Female,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Demotivational: unhealthy, out-of-shape rendering
    Shame,
    Toned,
    Ripped,
    /// Anthropomorphic furry body, animal rotating by day of year
    Furry,
}

impl Mode {
    /// Unknown values fall back to `Toned`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "shame" => Mode::Shame,
            "ripped" => Mode::Ripped,
            "furry" => Mode::Furry,
            _ => Mode::Toned,
        }
    }
}

/// Weekday flags. Days missing from the stored map are rest days.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkoutDays {
    pub monday: bool,
    pub tuesday: bool,
    pub wednesday: bool,
    pub thursday: bool,
    pub friday: bool,
    pub saturday: bool,
    pub sunday: bool,
}

impl WorkoutDays {
    pub fn is_workout_day(&self, day: Weekday) -> bool {
        match day {
            Weekday::Mon => self.monday,
            Weekday::Tue => self.tuesday,
            Weekday::Wed => self.wednesday,
            Weekday::Thu => self.thursday,
            Weekday::Fri => self.friday,
            Weekday::Sat => self.saturday,
            Weekday::Sun => self.sunday,
        }
    }

    pub fn only(day: Weekday) -> Self {
        let mut days = Self::default();
        match day {
            Weekday::Mon => days.monday = true,
            Weekday::Tue => days.tuesday = true,
            Weekday::Wed => days.wednesday = true,
            Weekday::Thu => days.thursday = true,
            Weekday::Fri => days.friday = true,
            Weekday::Sat => days.saturday = true,
            Weekday::Sun => days.sunday = true,
        }
        days
    }
}

/// Persistent pipeline stage, derived from stored fields at load time.
///
/// The per-date stages (generated / delivered) live on
/// [`crate::models::DailyArtifact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserStage {
    NoSelfie,
    PendingExtraction {
        selfie_key: String,
    },
    Extracted {
        selfie_key: String,
        embedding_key: String,
    },
}

impl UserStage {
    pub fn from_user(user: &User) -> Self {
        let selfie = user
            .selfie_object_key
            .as_deref()
            .filter(|k| !k.trim().is_empty());
        let embedding = user
            .embedding_object_key
            .as_deref()
            .filter(|k| !k.trim().is_empty());

        match (selfie, embedding) {
            (None, _) => UserStage::NoSelfie,
            (Some(selfie), None) => UserStage::PendingExtraction {
                selfie_key: selfie.to_string(),
            },
            (Some(selfie), Some(embedding)) => UserStage::Extracted {
                selfie_key: selfie.to_string(),
                embedding_key: embedding.to_string(),
            },
        }
    }
}
