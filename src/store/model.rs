use chrono::{NaiveDateTime, SecondsFormat};
use diesel::prelude::*;
use serde::{Serialize, Serializer};
use validator::{Validate, ValidationError};

/// A stored prediction, as returned by the list endpoint
#[derive(Queryable, Selectable, Debug, PartialEq, Clone, Serialize, utoipa::ToSchema)]
#[diesel(table_name = super::schema::predictions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    /// Assigned by the database, never reused
    pub id: i32,
    pub name: String,
    pub percent: f64,
    pub will_go: bool,
    pub emoji: String,
    pub title: String,
    pub message: String,
    pub special: bool,
    #[serde(serialize_with = "as_utc")]
    pub created_at: NaiveDateTime,
    #[serde(serialize_with = "as_utc")]
    pub updated_at: NaiveDateTime,
}

/// A prediction that passed boundary coercion, ready to be validated and inserted.
/// Timestamps are stamped by the store at insert time.
#[derive(Insertable, Validate, Debug, PartialEq, Clone)]
#[diesel(table_name = super::schema::predictions)]
pub struct NewPrediction {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(
        custom(function = "finite"),
        range(min = 0.0, max = 100.0)
    )]
    pub percent: f64,
    pub will_go: bool,
    pub emoji: String,
    pub title: String,
    pub message: String,
    pub special: bool,
}

fn finite(value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::new("finite"))
    }
}

/// Timestamps are kept naive in SQLite but always mean UTC
pub fn as_utc<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.and_utc().to_rfc3339_opts(SecondsFormat::Millis, true))
}
