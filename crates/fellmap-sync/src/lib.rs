//! Dataset build orchestration: listing -> detail scrape -> geocode -> merge -> snapshot.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fellmap_adapters::{AdapterContext, DetailTarget, FellrunnerAdapter, ListingConfig, RaceSource};
use fellmap_core::{month_name, parse_race_datetime, PostcodeLocation, RaceRecord, RaceTable};
use fellmap_geocode::{
    extract_postcode, postcode_key, resolve_postcodes, PostcodeLookup, PostcodesIoClient,
    DEFAULT_POSTCODES_URL,
};
use fellmap_storage::{HttpClientConfig, HttpFetcher, SnapshotStore};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fellmap-sync";

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub listing: ListingConfig,
    pub postcodes_url: String,
    pub data_path: PathBuf,
    pub map_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            listing: ListingConfig::default(),
            postcodes_url: DEFAULT_POSTCODES_URL.to_string(),
            data_path: PathBuf::from("data/race_data.parquet"),
            map_path: PathBuf::from("www/index.html"),
            user_agent: "fellmap-bot/0.1".to_string(),
            http_timeout_secs: 20,
        }
    }
}

impl BuildConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let first_page = *defaults.listing.upcoming_pages.start();
        let last_page = std::env::var("FELLMAP_UPCOMING_LAST_PAGE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(*defaults.listing.upcoming_pages.end());
        Self {
            listing: ListingConfig {
                base_url: std::env::var("FELLMAP_BASE_URL").unwrap_or(defaults.listing.base_url),
                index_url: std::env::var("FELLMAP_INDEX_URL").unwrap_or(defaults.listing.index_url),
                upcoming_url: std::env::var("FELLMAP_UPCOMING_URL")
                    .unwrap_or(defaults.listing.upcoming_url),
                upcoming_pages: first_page..=last_page,
            },
            postcodes_url: std::env::var("FELLMAP_POSTCODES_URL").unwrap_or(defaults.postcodes_url),
            data_path: std::env::var("FELLMAP_DATA_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_path),
            map_path: std::env::var("FELLMAP_MAP_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.map_path),
            user_agent: std::env::var("FELLMAP_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("FELLMAP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    /// Ignore any snapshot and rebuild from scratch.
    Full,
    /// Reuse the snapshot and only scrape races it does not contain.
    Incremental,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildCounts {
    pub listing_pages: usize,
    pub listed_races: usize,
    pub scraped_races: usize,
    pub postcodes_found: usize,
    pub postcodes_resolved: usize,
    pub added_races: usize,
    pub dropped_without_location: usize,
    pub total_races: usize,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub table: RaceTable,
    pub counts: BuildCounts,
}

/// Fill `postcode` from the venue text.
pub fn attach_postcode(mut record: RaceRecord) -> RaceRecord {
    record.postcode = record.venue.as_deref().and_then(extract_postcode);
    record
}

/// Keep only records whose postcode resolved, copying in the coordinates and
/// the service's spelling of the postcode. Returns the kept records and how
/// many were dropped.
pub fn inner_join_locations(
    records: Vec<RaceRecord>,
    locations: &[PostcodeLocation],
) -> (Vec<RaceRecord>, usize) {
    let by_key = locations
        .iter()
        .map(|loc| (postcode_key(&loc.postcode), loc))
        .collect::<HashMap<_, _>>();

    let total = records.len();
    let joined = records
        .into_iter()
        .filter_map(|mut record| {
            let loc = by_key.get(&postcode_key(record.postcode.as_deref()?))?;
            record.postcode = Some(loc.postcode.clone());
            record.latitude = Some(loc.latitude);
            record.longitude = Some(loc.longitude);
            Some(record)
        })
        .collect::<Vec<_>>();
    let dropped = total - joined.len();
    (joined, dropped)
}

/// Derived fields for a newly added row.
pub fn finalize_new_record(mut record: RaceRecord) -> RaceRecord {
    record.datetime = record.date_and_time.as_deref().and_then(parse_race_datetime);
    record.month = record.datetime.map(|dt| month_name(&dt).to_string());
    if record.website.is_none() {
        record.website = Some(record.race_url.clone());
    }
    record
}

pub struct DatasetBuilder<'a> {
    source: &'a dyn RaceSource,
    lookup: &'a dyn PostcodeLookup,
    http: &'a HttpFetcher,
    ctx: AdapterContext,
}

impl<'a> DatasetBuilder<'a> {
    pub fn new(
        source: &'a dyn RaceSource,
        lookup: &'a dyn PostcodeLookup,
        http: &'a HttpFetcher,
        ctx: AdapterContext,
    ) -> Self {
        Self {
            source,
            lookup,
            http,
            ctx,
        }
    }

    /// Build a new table from `previous` plus every listed race it lacks.
    /// Rows of `previous` are carried over untouched.
    pub async fn build(&self, previous: &RaceTable) -> Result<BuildOutcome> {
        let mut counts = BuildCounts::default();

        let listed = self.collect_detail_targets(&mut counts).await?;
        let known = previous.race_urls();
        let pending = listed
            .iter()
            .filter(|t| !known.contains(t.url.as_str()))
            .collect::<Vec<_>>();
        info!(
            listed = listed.len(),
            known = known.len(),
            pending = pending.len(),
            "race listing collected"
        );

        let mut scraped = Vec::with_capacity(pending.len());
        for target in pending {
            let page = self
                .source
                .fetch_detail(self.http, &self.ctx, target)
                .await
                .with_context(|| format!("fetching race page {}", target.url))?;
            let race = self
                .source
                .parse_detail(&page)
                .with_context(|| format!("parsing race page {}", target.url))?;
            scraped.push(attach_postcode(RaceRecord::from_scraped(race)));
        }
        counts.scraped_races = scraped.len();

        let postcodes = scraped
            .iter()
            .filter_map(|r| r.postcode.clone())
            .collect::<Vec<_>>();
        counts.postcodes_found = postcodes.len();
        let locations = resolve_postcodes(self.lookup, self.http, self.ctx.run_id, &postcodes)
            .await
            .context("resolving postcodes")?;
        counts.postcodes_resolved = locations.len();

        let (joined, dropped) = inner_join_locations(scraped, &locations);
        if dropped > 0 {
            warn!(dropped, "races without a resolvable postcode were left out");
        }
        counts.dropped_without_location = dropped;
        counts.added_races = joined.len();

        let table = RaceTable::concat(previous, joined.into_iter().map(finalize_new_record));
        counts.total_races = table.len();
        Ok(BuildOutcome { table, counts })
    }

    async fn collect_detail_targets(&self, counts: &mut BuildCounts) -> Result<Vec<DetailTarget>> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for listing in self.source.listing_targets() {
            let page = self
                .source
                .fetch_listing(self.http, &self.ctx, &listing)
                .await
                .with_context(|| format!("fetching listing {}", listing.url))?;
            let found = self
                .source
                .parse_listing(&page)
                .with_context(|| format!("parsing listing {}", listing.url))?;
            counts.listing_pages += 1;
            targets.extend(found.into_iter().filter(|t| seen.insert(t.url.clone())));
        }
        counts.listed_races = targets.len();
        Ok(targets)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildRunSummary {
    pub run_id: Uuid,
    pub mode: BuildMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub previous_races: usize,
    #[serde(flatten)]
    pub counts: BuildCounts,
    pub snapshot_path: String,
    pub snapshot_bytes: usize,
    pub snapshot_sha256: String,
}

#[derive(Debug, Clone)]
pub struct BuildRun {
    pub summary: BuildRunSummary,
    pub table: RaceTable,
}

pub struct BuildPipeline {
    config: BuildConfig,
    http: HttpFetcher,
    snapshots: SnapshotStore,
    source: Box<dyn RaceSource>,
    lookup: Box<dyn PostcodeLookup>,
}

impl BuildPipeline {
    pub fn new(config: BuildConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let snapshots = SnapshotStore::new(config.data_path.clone());
        let source = Box::new(FellrunnerAdapter::new(config.listing.clone()));
        let lookup = Box::new(PostcodesIoClient::new(config.postcodes_url.clone()));
        Ok(Self {
            config,
            http,
            snapshots,
            source,
            lookup,
        })
    }

    pub fn with_components(
        mut self,
        source: Box<dyn RaceSource>,
        lookup: Box<dyn PostcodeLookup>,
    ) -> Self {
        self.source = source;
        self.lookup = lookup;
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// One complete build. The snapshot is only overwritten once the whole
    /// build has succeeded.
    pub async fn run_once(&self, mode: BuildMode) -> Result<BuildRun> {
        let (run, ()) = self.run_once_then(mode, |_| Ok(())).await?;
        Ok(run)
    }

    /// Like [`run_once`](Self::run_once), with `before_save` run on the built
    /// table ahead of the snapshot write. An error from `before_save` aborts
    /// the run and leaves the previous snapshot in place.
    pub async fn run_once_then<T, F>(&self, mode: BuildMode, before_save: F) -> Result<(BuildRun, T)>
    where
        F: FnOnce(&RaceTable) -> Result<T>,
    {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("build", %run_id, source = self.source.source_id(), ?mode);

        async move {
            let previous = match mode {
                BuildMode::Full => RaceTable::new(),
                BuildMode::Incremental => self
                    .snapshots
                    .load()
                    .await?
                    .unwrap_or_default(),
            };
            info!(previous = previous.len(), "starting build");

            let builder = DatasetBuilder::new(
                self.source.as_ref(),
                self.lookup.as_ref(),
                &self.http,
                AdapterContext { run_id },
            );
            let outcome = builder.build(&previous).await?;
            let prepared = before_save(&outcome.table)?;

            let stored = self
                .snapshots
                .save(&outcome.table)
                .await
                .context("saving race snapshot")?;
            info!(
                rows = stored.rows,
                bytes = stored.byte_size,
                path = %stored.path.display(),
                "race snapshot saved"
            );

            let run = BuildRun {
                summary: BuildRunSummary {
                    run_id,
                    mode,
                    started_at,
                    finished_at: Utc::now(),
                    previous_races: previous.len(),
                    counts: outcome.counts,
                    snapshot_path: stored.path.display().to_string(),
                    snapshot_bytes: stored.byte_size,
                    snapshot_sha256: stored.sha256,
                },
                table: outcome.table,
            };
            Ok::<_, anyhow::Error>((run, prepared))
        }
        .instrument(span)
        .await
    }
}
