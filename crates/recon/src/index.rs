//! Snapshot index: one revision per calendar date.
//!
//! Revision labels carry the date the data describes as a short `M/D` or
//! `M.D` token ("Data as of 4/10", "04.10 update", "Update for 4/10/2020 case
//! counts"). The token is trusted as-is; the snapshot content is never
//! consulted to confirm it.

use std::collections::btree_map::Entry;
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::config::IndexConfig;
use crate::error::ReconError;
use crate::model::{Revision, SnapshotSelection};

fn date_token_re() -> &'static Regex {
    static DATE_TOKEN_RE: OnceLock<Regex> = OnceLock::new();
    DATE_TOKEN_RE.get_or_init(|| {
        // Month and day groups not touching other digits; an optional year
        // group is consumed so "4/10/2020" is not mistaken for "10/20".
        Regex::new(r"(?:^|[^0-9])([0-9]{1,2})[./]([0-9]{1,2})(?:[./]([0-9]{4}|[0-9]{2}))?(?:[^0-9]|$)")
            .expect("valid date token regex")
    })
}

/// The `M/D` token in a label, `.` separators normalized to `/`.
pub fn extract_date_token(label: &str) -> Option<String> {
    let caps = date_token_re().captures(label)?;
    let month = caps.get(1)?.as_str();
    let day = caps.get(2)?.as_str();
    Some(format!("{month}/{day}"))
}

/// Parse an `M/D` token against `year`.
pub fn parse_month_day(token: &str, year: i32) -> Option<NaiveDate> {
    let (month, day) = token.split_once('/')?;
    let month: u32 = month.parse().ok()?;
    let day: u32 = day.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// The calendar date a revision's label describes, `None` when the label has
/// no date token.
pub fn label_date(revision: &Revision, year: i32) -> Result<Option<NaiveDate>, ReconError> {
    let Some(token) = extract_date_token(&revision.label) else {
        return Ok(None);
    };
    parse_month_day(&token, year)
        .map(Some)
        .ok_or_else(|| ReconError::LabelParse {
            revision: revision.id.clone(),
            label: revision.label.clone(),
            token,
        })
}

/// Select one revision per calendar date.
///
/// Within a date the latest `recorded_at` wins; identical timestamps fall back
/// to the lexicographically smallest revision id so the choice never depends
/// on input order. Dates before `config.min_date` are dropped.
pub fn select_snapshots<'a>(
    revisions: impl IntoIterator<Item = &'a Revision>,
    config: &IndexConfig,
) -> Result<SnapshotSelection, ReconError> {
    let mut selection = SnapshotSelection::new();
    let mut undated = 0usize;

    for revision in revisions {
        let Some(date) = label_date(revision, config.assumed_year)? else {
            undated += 1;
            log::debug!("revision {}: no date in label {:?}", revision.short_id(), revision.label);
            continue;
        };

        match selection.entry(date) {
            Entry::Vacant(slot) => {
                slot.insert(revision.clone());
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                let newer = revision.recorded_at > current.recorded_at
                    || (revision.recorded_at == current.recorded_at && revision.id < current.id);
                log::debug!(
                    "{date}: revision {} {} {}",
                    revision.short_id(),
                    if newer { "supersedes" } else { "superseded by" },
                    current.short_id(),
                );
                if newer {
                    slot.insert(revision.clone());
                }
            }
        }
    }

    let before_cutoff: Vec<NaiveDate> = selection
        .range(..config.min_date)
        .map(|(date, _)| *date)
        .collect();
    for date in &before_cutoff {
        selection.remove(date);
    }

    log::info!(
        "selected {} snapshot(s); {} undated revision(s), {} date(s) before {}",
        selection.len(),
        undated,
        before_cutoff.len(),
        config.min_date,
    );

    Ok(selection)
}
