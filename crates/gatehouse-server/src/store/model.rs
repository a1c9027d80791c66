use std::collections::HashMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::Record;

/// Platform value on an archive marker that matches every platform.
pub const ALL_PLATFORMS: &str = "all";

// ── API keys ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: String,
    #[serde(rename = "appID")]
    pub app_id: String,
    #[serde(default)]
    pub perm: HashMap<String, bool>,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl ApiKey {
    /// Returns true once the key's expiration has passed. Keys without an
    /// expiration never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiration, Some(exp) if exp <= now)
    }

    pub fn has_perm(&self, perm: &str) -> bool {
        self.perm.get(perm).copied().unwrap_or(false)
    }
}

impl Record for ApiKey {
    fn id(&self) -> &str {
        &self.id
    }
}

// ── Users ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    /// Hex-encoded Argon2id output.
    pub password_hash: String,
    /// Hex-encoded random salt.
    pub salt: String,
    pub email: String,
    #[serde(default)]
    pub fail_count: u32,
    #[serde(default)]
    pub lockout_until: Option<DateTime<Utc>>,
    /// Tokens issued before this instant no longer verify.
    #[serde(default)]
    pub password_changed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub perm: HashMap<String, String>,
}

impl User {
    pub fn is_locked_out(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lockout_until, Some(until) if until > now)
    }
}

impl Record for User {
    fn id(&self) -> &str {
        &self.id
    }
}

// ── Usage counts ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountLog {
    pub id: String,
    pub platform: String,
    /// Day of the last ping as `YYYYMMDD`.
    pub date: u32,
}

impl Record for CountLog {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Encodes a calendar day as `YYYYMMDD`, the format stored in [`CountLog::date`].
pub fn date_stamp(day: NaiveDate) -> u32 {
    let year = u32::try_from(day.year()).unwrap_or(0);
    year * 10_000 + day.month() * 100 + day.day()
}

/// Today's UTC date as `YYYYMMDD`.
pub fn today() -> u32 {
    date_stamp(Utc::now().date_naive())
}

// ── Crashes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndividualCrash {
    pub platform: String,
    pub version: String,
    /// Top-level error summary.
    pub error: String,
    /// Full stack trace.
    pub stack: String,
    #[serde(default)]
    pub count: u32,
}

impl IndividualCrash {
    pub fn first_line(&self) -> &str {
        first_line(&self.stack)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashReport {
    pub id: String,
    pub error: String,
    pub first_line: String,
    pub individual: Vec<IndividualCrash>,
}

impl CrashReport {
    /// True when `crash` belongs to this report's (error, first line) group.
    pub fn groups(&self, crash: &IndividualCrash) -> bool {
        self.error == crash.error && self.first_line == crash.first_line()
    }

    /// Drops every individual entry covered by `marker`. Returns how many were
    /// removed.
    pub fn prune(&mut self, marker: &ArchivedCrash) -> usize {
        let before = self.individual.len();
        self.individual.retain(|ind| !marker.covers(ind));
        before - self.individual.len()
    }
}

impl Record for CrashReport {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedCrash {
    pub error: String,
    pub stack: String,
    #[serde(default)]
    pub platform: String,
}

impl ArchivedCrash {
    /// Fills in the "all platforms" default for an unset platform.
    pub fn normalized(mut self) -> Self {
        if self.platform.is_empty() {
            self.platform = ALL_PLATFORMS.to_owned();
        }
        self
    }

    pub fn first_line(&self) -> &str {
        first_line(&self.stack)
    }

    /// Whether this marker archives `crash`. The error is not compared here:
    /// callers only consult markers for the report group the crash belongs to.
    pub fn covers(&self, crash: &IndividualCrash) -> bool {
        self.stack == crash.stack
            && (self.platform == ALL_PLATFORMS || self.platform == crash.platform)
    }
}

/// Everything before the first newline of a stack trace.
pub fn first_line(stack: &str) -> &str {
    stack.split_once('\n').map_or(stack, |(first, _)| first)
}
