//! Core race model shared by the scraping, geocoding and rendering crates.

use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "fellmap-core";

/// Calendar month names in layer order.
pub const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

const WEEKDAY_NAMES: [&str; 14] = [
    "monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday", "mon", "tue",
    "wed", "thu", "fri", "sat", "sun",
];

const DATE_FORMATS: [&str; 5] = ["%d %B %Y", "%d %b %Y", "%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y"];
const TIME_FORMATS: [&str; 3] = ["%I:%M%p", "%I:%M %p", "%H:%M"];

/// Raw detail-page scrape: normalized label -> value, plus the two injected fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedRace {
    pub race_url: String,
    pub title: String,
    pub fields: BTreeMap<String, String>,
}

/// One row of the race table, keyed by `race_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceRecord {
    pub race_url: String,
    pub title: String,
    pub venue: Option<String>,
    #[serde(rename = "date_&_time")]
    pub date_and_time: Option<String>,
    pub datetime: Option<NaiveDateTime>,
    pub month: Option<String>,
    pub distance: Option<String>,
    pub climb: Option<String>,
    pub category: Option<String>,
    pub website: Option<String>,
    pub postcode: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Labels the typed fields do not cover.
    pub extra: BTreeMap<String, String>,
}

impl RaceRecord {
    pub fn new(race_url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            race_url: race_url.into(),
            title: title.into(),
            venue: None,
            date_and_time: None,
            datetime: None,
            month: None,
            distance: None,
            climb: None,
            category: None,
            website: None,
            postcode: None,
            latitude: None,
            longitude: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn from_scraped(scraped: ScrapedRace) -> Self {
        let mut record = Self::new(scraped.race_url, scraped.title);
        for (name, value) in scraped.fields {
            match name.as_str() {
                "venue" => record.venue = Some(value),
                "date_&_time" => record.date_and_time = Some(value),
                "distance" => record.distance = Some(value),
                "climb" => record.climb = Some(value),
                "category" => record.category = Some(value),
                "website" => record.website = Some(value),
                _ => {
                    record.extra.insert(name, value);
                }
            }
        }
        record
    }

    pub fn has_location(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

/// Resolved coordinates for one postcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostcodeLocation {
    pub postcode: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Ordered race rows with unique `race_url`s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RaceTable {
    records: Vec<RaceRecord>,
}

impl RaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table, dropping any later row whose `race_url` was already seen.
    pub fn from_records(records: impl IntoIterator<Item = RaceRecord>) -> Self {
        let mut seen = HashSet::new();
        let records = records
            .into_iter()
            .filter(|r| seen.insert(r.race_url.clone()))
            .collect();
        Self { records }
    }

    /// Prior rows followed by new rows; a new row never replaces a known URL.
    pub fn concat(prior: &RaceTable, new_rows: impl IntoIterator<Item = RaceRecord>) -> Self {
        Self::from_records(prior.records.iter().cloned().chain(new_rows))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[RaceRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RaceRecord> {
        self.records.iter()
    }

    pub fn race_urls(&self) -> HashSet<&str> {
        self.records.iter().map(|r| r.race_url.as_str()).collect()
    }
}

impl<'a> IntoIterator for &'a RaceTable {
    type Item = &'a RaceRecord;
    type IntoIter = std::slice::Iter<'a, RaceRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Best-effort parse of the free-text date line on a race page.
///
/// Weekday names, ordinal suffixes and a joining "at" are ignored, so
/// `"Saturday 12th May 2024 at 10:30"` and `"12 May 2024"` both parse.
/// Anything else yields `None`.
pub fn parse_race_datetime(text: &str) -> Option<NaiveDateTime> {
    let cleaned = clean_date_text(text);
    if cleaned.is_empty() {
        return None;
    }
    DATE_FORMATS.iter().find_map(|fmt| {
        let (date, rest) = NaiveDate::parse_and_remainder(&cleaned, fmt).ok()?;
        let time = parse_leading_time(rest).unwrap_or(NaiveTime::MIN);
        Some(date.and_time(time))
    })
}

pub fn month_name(datetime: &NaiveDateTime) -> &'static str {
    MONTH_NAMES[datetime.month0() as usize]
}

fn parse_leading_time(rest: &str) -> Option<NaiveTime> {
    let rest = rest.trim_start();
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_and_remainder(rest, fmt).ok().map(|(t, _)| t))
}

fn clean_date_text(text: &str) -> String {
    text.replace(',', " ")
        .split_whitespace()
        .filter(|token| {
            let lower = token.trim_end_matches('.').to_ascii_lowercase();
            lower != "at" && !WEEKDAY_NAMES.contains(&lower.as_str())
        })
        .map(strip_ordinal_suffix)
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_ordinal_suffix(token: &str) -> &str {
    let lower = token.to_ascii_lowercase();
    for suffix in ["st", "nd", "rd", "th"] {
        if lower.ends_with(suffix) {
            let digits = &token[..token.len() - suffix.len()];
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                return digits;
            }
        }
    }
    token
}
