//! Sync window evaluation
//!
//! A sync window is a cron schedule plus a duration: the window is open for
//! `duration` after every schedule tick. Deny windows block syncs while open;
//! allow windows block syncs while *closed*. Either kind may let manual syncs
//! through with `manualSync: true`.

use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::Application;
use crate::{glob, Error, Result};

/// Whether a window permits or blocks syncs while open
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncWindowKind {
    /// Syncs may only run while the window is open
    #[default]
    Allow,
    /// Syncs may not run while the window is open
    Deny,
}

/// A time-scheduled sync policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncWindow {
    /// Allow or deny
    pub kind: SyncWindowKind,
    /// Cron schedule (5 fields, or 6 with leading seconds)
    pub schedule: String,
    /// How long the window stays open after each tick (e.g. `1h30m`)
    pub duration: String,
    /// Application name globs the window applies to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applications: Vec<String>,
    /// Destination namespace globs the window applies to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    /// Destination cluster (server URL or name) globs the window applies to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<String>,
    /// Let manual syncs through regardless of the window
    #[serde(default)]
    pub manual_sync: bool,
    /// IANA time zone the schedule is evaluated in (UTC when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

impl SyncWindow {
    /// Whether the window is open at `now`.
    ///
    /// Open when the first tick after `now - duration` is strictly before `now`.
    pub fn active_at(&self, now: DateTime<Utc>) -> Result<bool> {
        let schedule = self.parse_schedule()?;
        let duration = parse_duration(&self.duration)
            .ok_or_else(|| Error::sync_window(&self.schedule, format!("invalid duration '{}'", self.duration)))?;
        let tz = self.parse_time_zone()?;

        let now = now.with_timezone(&tz);
        let from = now - duration;
        Ok(schedule.after(&from).next().is_some_and(|tick| tick < now))
    }

    /// Whether the window applies to the given Application
    pub fn applies_to(&self, app: &Application) -> bool {
        let dest = &app.spec.destination;
        glob::any_matches(&self.applications, app.name())
            || glob::any_matches(
                &self.namespaces,
                dest.namespace.as_deref().unwrap_or_default(),
            )
            || glob::any_matches(&self.clusters, dest.server.as_deref().unwrap_or_default())
            || glob::any_matches(&self.clusters, dest.name.as_deref().unwrap_or_default())
    }

    fn parse_schedule(&self) -> Result<cron::Schedule> {
        let fields = self.schedule.split_whitespace().count();
        let expr = match fields {
            5 => format!("0 {}", self.schedule),
            6 | 7 => self.schedule.clone(),
            n => {
                return Err(Error::sync_window(
                    &self.schedule,
                    format!("expected 5 or 6 fields, found {n}"),
                ))
            }
        };
        cron::Schedule::from_str(&expr)
            .map_err(|e| Error::sync_window(&self.schedule, format!("invalid cron: {e}")))
    }

    fn parse_time_zone(&self) -> Result<Tz> {
        match self.time_zone.as_deref() {
            None | Some("") => Ok(Tz::UTC),
            Some(name) => name.parse::<Tz>().map_err(|e| {
                Error::sync_window(&self.schedule, format!("invalid time zone '{name}': {e}"))
            }),
        }
    }
}

/// Parse a Go-style duration such as `1h`, `30m`, `1h30m` or `90s`.
pub fn parse_duration(value: &str) -> Option<TimeDelta> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let mut total = TimeDelta::zero();
    let mut digits = String::new();
    for c in value.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let amount: i64 = digits.parse().ok()?;
        digits.clear();
        let part = match c {
            'h' => TimeDelta::try_hours(amount)?,
            'm' => TimeDelta::try_minutes(amount)?,
            's' => TimeDelta::try_seconds(amount)?,
            _ => return None,
        };
        total = total.checked_add(&part)?;
    }

    // trailing digits without a unit
    if !digits.is_empty() {
        return None;
    }
    Some(total)
}

/// A set of sync windows evaluated together
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncWindows(Vec<SyncWindow>);

impl SyncWindows {
    /// Wrap a list of windows
    pub fn new(windows: Vec<SyncWindow>) -> Self {
        Self(windows)
    }

    /// The windows in this set
    pub fn windows(&self) -> &[SyncWindow] {
        &self.0
    }

    /// Whether the set is non-empty
    pub fn has_windows(&self) -> bool {
        !self.0.is_empty()
    }

    /// Windows that apply to the given Application
    pub fn matching(&self, app: &Application) -> SyncWindows {
        Self(self.0.iter().filter(|w| w.applies_to(app)).cloned().collect())
    }

    /// Windows open at `now`
    pub fn active(&self, now: DateTime<Utc>) -> Result<SyncWindows> {
        let mut active = Vec::new();
        for window in &self.0 {
            if window.active_at(now)? {
                active.push(window.clone());
            }
        }
        Ok(Self(active))
    }

    /// Allow windows closed at `now`
    pub fn inactive_allows(&self, now: DateTime<Utc>) -> Result<SyncWindows> {
        let mut inactive = Vec::new();
        for window in &self.0 {
            if window.kind == SyncWindowKind::Allow && !window.active_at(now)? {
                inactive.push(window.clone());
            }
        }
        Ok(Self(inactive))
    }

    /// Whether a sync may start at `now`.
    pub fn can_sync(&self, is_manual: bool, now: DateTime<Utc>) -> Result<bool> {
        if !self.has_windows() {
            return Ok(true);
        }

        let active = self.active(now)?;
        let denies: Vec<&SyncWindow> = active
            .0
            .iter()
            .filter(|w| w.kind == SyncWindowKind::Deny)
            .collect();
        if !denies.is_empty() {
            return Ok(is_manual && denies.iter().all(|w| w.manual_sync));
        }

        if active.0.iter().any(|w| w.kind == SyncWindowKind::Allow) {
            return Ok(true);
        }

        let inactive_allows = self.inactive_allows(now)?;
        if inactive_allows.has_windows() {
            return Ok(is_manual && inactive_allows.0.iter().any(|w| w.manual_sync));
        }

        Ok(true)
    }
}
