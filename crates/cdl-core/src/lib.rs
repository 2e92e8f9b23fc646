//! Core domain types for the civic dataset loader.

use std::fmt;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cdl-core";

/// Build timestamps are recorded in the city's local time, not UTC.
pub const CIVIC_TZ: Tz = chrono_tz::America::New_York;

/// Namespace that application readers query.
pub const PUBLIC_SCHEMA: &str = "public";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentError {
    #[error("SQL identifier is empty")]
    Empty,
    #[error("SQL identifier '{0}' is longer than 63 bytes")]
    TooLong(String),
    #[error("'{0}' is not a plain SQL identifier")]
    Invalid(String),
}

/// A plain, unquoted PostgreSQL identifier (`[a-z_][a-z0-9_]*`).
///
/// Identifiers are interpolated into DDL, so anything that would need quoting is
/// rejected up front. Upper-case input is folded the same way PostgreSQL folds
/// unquoted names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SqlIdent(String);

impl SqlIdent {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, IdentError> {
        let raw = raw.as_ref();
        if raw.is_empty() {
            return Err(IdentError::Empty);
        }
        if raw.len() > 63 {
            return Err(IdentError::TooLong(raw.to_string()));
        }
        let mut chars = raw.chars();
        let first_ok = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(IdentError::Invalid(raw.to_string()));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn public() -> Self {
        Self(PUBLIC_SCHEMA.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SqlIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SqlIdent {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SqlIdent {
    type Error = IdentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SqlIdent> for String {
    fn from(value: SqlIdent) -> Self {
        value.0
    }
}

/// One physical table and the logical dataset that owns it.
///
/// Ownership is informational only; it shows up in logs and error messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub name: SqlIdent,
    pub dataset: String,
}

impl TableRef {
    pub fn new(name: SqlIdent, dataset: impl Into<String>) -> Self {
        Self {
            name,
            dataset: dataset.into(),
        }
    }

    pub fn qualified(&self, schema: &SqlIdent) -> String {
        format!("{schema}.{}", self.name)
    }
}

pub fn staging_schema_prefix(dataset: &SqlIdent) -> String {
    format!("temp_{dataset}_")
}

/// `temp_<dataset>_<unix-seconds>`; the suffix is what makes stale namespaces
/// identifiable after a crash.
pub fn staging_schema_name(dataset: &SqlIdent, created_at: DateTime<Utc>) -> Result<SqlIdent, IdentError> {
    SqlIdent::new(format!(
        "{}{}",
        staging_schema_prefix(dataset),
        created_at.timestamp()
    ))
}

pub fn staging_schema_created_at(schema: &str) -> Option<DateTime<Utc>> {
    let secs = schema.rsplit('_').next()?.parse::<i64>().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

pub fn friendly_staging_creation_time(schema: &str) -> Option<String> {
    staging_schema_created_at(schema).map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
}

/// ISO-8601 rendering of `at` in [`CIVIC_TZ`].
pub fn civic_timestamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&CIVIC_TZ)
        .to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// How often a dataset is rebuilt, independent of the scheduler that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    /// Daily at around midnight Eastern (05:00 UTC).
    Daily,
    EveryOtherDay,
    /// First of the month, 05:00 UTC.
    Monthly,
    #[default]
    Yearly,
}

impl Frequency {
    pub const ALL: [Frequency; 4] = [
        Frequency::Daily,
        Frequency::EveryOtherDay,
        Frequency::Monthly,
        Frequency::Yearly,
    ];

    /// CloudWatch / EventBridge schedule expression. All times are UTC.
    pub fn aws(self) -> String {
        match self {
            Frequency::Daily => "cron(0 5 * * ? *)".to_string(),
            Frequency::EveryOtherDay => "cron(0 5 */2 * ? *)".to_string(),
            Frequency::Monthly => "cron(0 5 1 * ? *)".to_string(),
            Frequency::Yearly => "rate(365 days)".to_string(),
        }
    }

    /// Kubernetes CronJob `spec.schedule`.
    pub fn k8s(self) -> String {
        match self {
            Frequency::Daily => "0 5 * * *".to_string(),
            Frequency::EveryOtherDay => "0 5 */2 * *".to_string(),
            Frequency::Monthly => "0 5 1 * *".to_string(),
            Frequency::Yearly => "@yearly".to_string(),
        }
    }

    /// Six-field (seconds-first) expression for an in-process cron scheduler.
    pub fn tokio_cron(self) -> String {
        match self {
            Frequency::Daily => "0 0 5 * * *".to_string(),
            Frequency::EveryOtherDay => "0 0 5 */2 * *".to_string(),
            Frequency::Monthly => "0 0 5 1 * *".to_string(),
            Frequency::Yearly => "0 0 5 1 1 *".to_string(),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Frequency::Daily => "daily",
            Frequency::EveryOtherDay => "every_other_day",
            Frequency::Monthly => "monthly",
            Frequency::Yearly => "yearly",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_fold_case_and_reject_injection() {
        assert_eq!(SqlIdent::new("HPD_Registrations").unwrap().as_str(), "hpd_registrations");
        assert_eq!(SqlIdent::new(""), Err(IdentError::Empty));
        assert!(matches!(SqlIdent::new("1abc"), Err(IdentError::Invalid(_))));
        assert!(matches!(
            SqlIdent::new("x; DROP TABLE y"),
            Err(IdentError::Invalid(_))
        ));
        assert!(matches!(SqlIdent::new("a".repeat(64)), Err(IdentError::TooLong(_))));
    }

    #[test]
    fn staging_names_embed_creation_time() {
        let dataset = SqlIdent::new("hpd_registrations").unwrap();
        let at = Utc.with_ymd_and_hms(2019, 1, 1, 20, 56, 28).single().unwrap();
        let name = staging_schema_name(&dataset, at).unwrap();

        assert_eq!(name.as_str(), format!("temp_hpd_registrations_{}", at.timestamp()));
        assert!(name.as_str().starts_with(&staging_schema_prefix(&dataset)));
        assert_eq!(staging_schema_created_at(name.as_str()), Some(at));
        assert_eq!(
            friendly_staging_creation_time(name.as_str()).as_deref(),
            Some("2019-01-01 20:56:28 UTC")
        );
        assert_eq!(staging_schema_created_at("public"), None);
    }

    #[test]
    fn civic_timestamps_are_local_not_utc() {
        let winter = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
        assert_eq!(civic_timestamp(winter), "2023-12-31T19:00:00.000000-05:00");

        let summer = Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).single().unwrap();
        assert_eq!(civic_timestamp(summer), "2024-07-01T08:00:00.000000-04:00");
    }

    #[test]
    fn frequencies_render_for_each_scheduler() {
        assert_eq!(Frequency::Daily.aws(), "cron(0 5 * * ? *)");
        assert_eq!(Frequency::Daily.k8s(), "0 5 * * *");
        assert_eq!(Frequency::EveryOtherDay.aws(), "cron(0 5 */2 * ? *)");
        assert_eq!(Frequency::EveryOtherDay.k8s(), "0 5 */2 * *");
        assert_eq!(Frequency::Yearly.aws(), "rate(365 days)");
        assert_eq!(Frequency::Yearly.k8s(), "@yearly");
        assert_eq!(Frequency::default(), Frequency::Yearly);
        for f in Frequency::ALL {
            assert_eq!(f.tokio_cron().split_whitespace().count(), 6);
        }
    }

    #[test]
    fn table_refs_qualify_with_schema() {
        let t = TableRef::new(SqlIdent::new("blarg").unwrap(), "boop");
        assert_eq!(t.qualified(&SqlIdent::public()), "public.blarg");
    }
}
