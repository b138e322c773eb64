use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use common::{
    error::AppError,
    storage::types::retrievable_unit::RetrievableUnit,
    utils::data_dictionary::Record,
};
use tracing::debug;

/// Identities to add to and refresh in a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionDiff {
    pub to_add: Vec<String>,
    pub to_update: Vec<String>,
}

impl CollectionDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty()
    }
}

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

/// Parses a last-change value. Values without an offset are read as UTC.
pub fn parse_change_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt.and_utc());
        }
    }

    NAIVE_DATE_FORMATS.iter().find_map(|format| {
        NaiveDate::parse_from_str(value, format)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    })
}

/// Compares incoming records with the units already stored in a collection.
///
/// Identities only present in the collection are left alone. An identity present on both
/// sides is an update only when its incoming timestamp is strictly newer.
pub fn diff_collection<'a, I>(
    records: I,
    stored: &[RetrievableUnit],
    id_column: &str,
    last_change_column: &str,
) -> Result<CollectionDiff, AppError>
where
    I: IntoIterator<Item = &'a Record>,
{
    let stored_changes: HashMap<&str, &RetrievableUnit> =
        stored.iter().map(|unit| (unit.id.as_str(), unit)).collect();

    let mut seen = HashSet::new();
    let mut diff = CollectionDiff::default();

    for record in records {
        let Some(id) = record.get(id_column) else {
            continue;
        };
        if !seen.insert(id) {
            continue;
        }

        let Some(existing) = stored_changes.get(id) else {
            diff.to_add.push(id.to_string());
            continue;
        };

        let stored_at = existing
            .metadata_str(last_change_column)
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "stored unit '{id}' has no '{last_change_column}' value"
                ))
            })
            .and_then(|raw| {
                parse_change_timestamp(raw).ok_or_else(|| {
                    AppError::Validation(format!(
                        "stored unit '{id}' has an unreadable '{last_change_column}': '{raw}'"
                    ))
                })
            })?;

        let incoming_raw = record.get(last_change_column).ok_or_else(|| {
            AppError::Validation(format!(
                "record '{id}' has no '{last_change_column}' value"
            ))
        })?;
        let incoming_at = parse_change_timestamp(incoming_raw).ok_or_else(|| {
            AppError::Validation(format!(
                "record '{id}' has an unreadable '{last_change_column}': '{incoming_raw}'"
            ))
        })?;

        if incoming_at > stored_at {
            diff.to_update.push(id.to_string());
        }
    }

    debug!(
        to_add = diff.to_add.len(),
        to_update = diff.to_update.len(),
        stored = stored.len(),
        "Computed collection diff"
    );

    Ok(diff)
}
