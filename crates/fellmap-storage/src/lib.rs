//! HTTP fetch utilities, atomic file writes and the Parquet race-table snapshot.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arrow_array::{Array, ArrayRef, Float64Array, RecordBatch, StringArray, TimestampMillisecondArray};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use chrono::DateTime;
use fellmap_core::{RaceRecord, RaceTable};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fellmap-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` through a temp file and rename, so readers never
/// observe a half-written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-attempt HTTP client. Each call is made exactly once; there is no
/// retry, backoff or concurrency limiting.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async {
            let resp = self.client.get(url).send().await?;
            read_success(resp).await
        }
        .instrument(span)
        .await
    }

    pub async fn post_json<B>(
        &self,
        run_id: Uuid,
        url: &str,
        body: &B,
    ) -> Result<FetchedResponse, FetchError>
    where
        B: Serialize + ?Sized + Sync,
    {
        let span = info_span!("http_post", %run_id, url);
        async {
            let resp = self.client.post(url).json(body).send().await?;
            read_success(resp).await
        }
        .instrument(span)
        .await
    }
}

async fn read_success(resp: reqwest::Response) -> Result<FetchedResponse, FetchError> {
    let status = resp.status();
    let final_url = resp.url().to_string();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url,
        });
    }
    let body = resp.bytes().await?.to_vec();
    debug!(status = status.as_u16(), bytes = body.len(), "response received");
    Ok(FetchedResponse {
        status,
        final_url,
        body,
    })
}

const COL_RACE_URL: &str = "race_url";
const COL_TITLE: &str = "title";
const COL_VENUE: &str = "venue";
const COL_DATE_AND_TIME: &str = "date_&_time";
const COL_DATETIME: &str = "datetime";
const COL_MONTH: &str = "month";
const COL_DISTANCE: &str = "distance";
const COL_CLIMB: &str = "climb";
const COL_CATEGORY: &str = "category";
const COL_WEBSITE: &str = "website";
const COL_POSTCODE: &str = "postcode";
const COL_LATITUDE: &str = "latitude";
const COL_LONGITUDE: &str = "longitude";
const COL_EXTRA: &str = "extra_json";

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub path: PathBuf,
    pub rows: usize,
    pub byte_size: usize,
    pub sha256: String,
}

/// The persisted race table: one Parquet file, read once and overwritten once per run.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no snapshot has been written yet.
    pub async fn load(&self) -> anyhow::Result<Option<RaceTable>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking snapshot path {}", self.path.display()))?
        {
            return Ok(None);
        }

        let file = File::open(&self.path)
            .with_context(|| format!("opening snapshot {}", self.path.display()))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .with_context(|| format!("reading parquet metadata {}", self.path.display()))?
            .build()
            .with_context(|| format!("opening parquet reader {}", self.path.display()))?;

        let mut records = Vec::new();
        for batch in reader {
            let batch =
                batch.with_context(|| format!("reading record batch {}", self.path.display()))?;
            records.extend(record_batch_to_records(&batch)?);
        }
        Ok(Some(RaceTable::from_records(records)))
    }

    pub async fn save(&self, table: &RaceTable) -> anyhow::Result<StoredSnapshot> {
        let bytes = encode_snapshot(table)?;
        write_atomic(&self.path, &bytes).await?;
        Ok(StoredSnapshot {
            path: self.path.clone(),
            rows: table.len(),
            byte_size: bytes.len(),
            sha256: sha256_hex(&bytes),
        })
    }
}

fn snapshot_schema() -> Schema {
    Schema::new(vec![
        ArrowField::new(COL_RACE_URL, DataType::Utf8, false),
        ArrowField::new(COL_TITLE, DataType::Utf8, false),
        ArrowField::new(COL_VENUE, DataType::Utf8, true),
        ArrowField::new(COL_DATE_AND_TIME, DataType::Utf8, true),
        ArrowField::new(
            COL_DATETIME,
            DataType::Timestamp(TimeUnit::Millisecond, None),
            true,
        ),
        ArrowField::new(COL_MONTH, DataType::Utf8, true),
        ArrowField::new(COL_DISTANCE, DataType::Utf8, true),
        ArrowField::new(COL_CLIMB, DataType::Utf8, true),
        ArrowField::new(COL_CATEGORY, DataType::Utf8, true),
        ArrowField::new(COL_WEBSITE, DataType::Utf8, true),
        ArrowField::new(COL_POSTCODE, DataType::Utf8, true),
        ArrowField::new(COL_LATITUDE, DataType::Float64, true),
        ArrowField::new(COL_LONGITUDE, DataType::Float64, true),
        ArrowField::new(COL_EXTRA, DataType::Utf8, false),
    ])
}

fn optional_strings<F>(records: &[RaceRecord], get: F) -> ArrayRef
where
    F: Fn(&RaceRecord) -> Option<&str>,
{
    Arc::new(StringArray::from(records.iter().map(get).collect::<Vec<_>>()))
}

pub fn table_to_record_batch(table: &RaceTable) -> anyhow::Result<RecordBatch> {
    let records = table.records();
    let extras = records
        .iter()
        .map(|r| serde_json::to_string(&r.extra).map(Some))
        .collect::<Result<Vec<_>, _>>()
        .context("serializing extra fields")?;
    let datetimes = records
        .iter()
        .map(|r| r.datetime.map(|dt| dt.and_utc().timestamp_millis()))
        .collect::<Vec<_>>();

    let columns: Vec<ArrayRef> = vec![
        optional_strings(records, |r| Some(r.race_url.as_str())),
        optional_strings(records, |r| Some(r.title.as_str())),
        optional_strings(records, |r| r.venue.as_deref()),
        optional_strings(records, |r| r.date_and_time.as_deref()),
        Arc::new(TimestampMillisecondArray::from(datetimes)),
        optional_strings(records, |r| r.month.as_deref()),
        optional_strings(records, |r| r.distance.as_deref()),
        optional_strings(records, |r| r.climb.as_deref()),
        optional_strings(records, |r| r.category.as_deref()),
        optional_strings(records, |r| r.website.as_deref()),
        optional_strings(records, |r| r.postcode.as_deref()),
        Arc::new(Float64Array::from(records.iter().map(|r| r.latitude).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(records.iter().map(|r| r.longitude).collect::<Vec<_>>())),
        Arc::new(StringArray::from(extras)),
    ];

    RecordBatch::try_new(Arc::new(snapshot_schema()), columns)
        .context("building race table record batch")
}

pub fn encode_snapshot(table: &RaceTable) -> anyhow::Result<Vec<u8>> {
    let batch = table_to_record_batch(table)?;
    let mut buf = Vec::new();
    {
        let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None)
            .context("opening parquet writer")?;
        writer.write(&batch).context("writing race table batch")?;
        writer.close().context("closing parquet writer")?;
    }
    Ok(buf)
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> anyhow::Result<&'a T> {
    batch
        .column_by_name(name)
        .with_context(|| format!("snapshot is missing column {name}"))?
        .as_any()
        .downcast_ref::<T>()
        .with_context(|| format!("snapshot column {name} has unexpected type"))
}

fn string_at(col: &StringArray, idx: usize) -> Option<String> {
    (!col.is_null(idx)).then(|| col.value(idx).to_string())
}

fn float_at(col: &Float64Array, idx: usize) -> Option<f64> {
    (!col.is_null(idx)).then(|| col.value(idx))
}

pub fn record_batch_to_records(batch: &RecordBatch) -> anyhow::Result<Vec<RaceRecord>> {
    let race_urls = column::<StringArray>(batch, COL_RACE_URL)?;
    let titles = column::<StringArray>(batch, COL_TITLE)?;
    let venues = column::<StringArray>(batch, COL_VENUE)?;
    let dates = column::<StringArray>(batch, COL_DATE_AND_TIME)?;
    let datetimes = column::<TimestampMillisecondArray>(batch, COL_DATETIME)?;
    let months = column::<StringArray>(batch, COL_MONTH)?;
    let distances = column::<StringArray>(batch, COL_DISTANCE)?;
    let climbs = column::<StringArray>(batch, COL_CLIMB)?;
    let categories = column::<StringArray>(batch, COL_CATEGORY)?;
    let websites = column::<StringArray>(batch, COL_WEBSITE)?;
    let postcodes = column::<StringArray>(batch, COL_POSTCODE)?;
    let latitudes = column::<Float64Array>(batch, COL_LATITUDE)?;
    let longitudes = column::<Float64Array>(batch, COL_LONGITUDE)?;
    let extras = column::<StringArray>(batch, COL_EXTRA)?;

    let mut out = Vec::with_capacity(batch.num_rows());
    for idx in 0..batch.num_rows() {
        let race_url = string_at(race_urls, idx)
            .with_context(|| format!("snapshot row {idx} has no race_url"))?;
        let mut record = RaceRecord::new(race_url, string_at(titles, idx).unwrap_or_default());
        record.venue = string_at(venues, idx);
        record.date_and_time = string_at(dates, idx);
        record.datetime = (!datetimes.is_null(idx))
            .then(|| DateTime::from_timestamp_millis(datetimes.value(idx)))
            .flatten()
            .map(|dt| dt.naive_utc());
        record.month = string_at(months, idx);
        record.distance = string_at(distances, idx);
        record.climb = string_at(climbs, idx);
        record.category = string_at(categories, idx);
        record.website = string_at(websites, idx);
        record.postcode = string_at(postcodes, idx);
        record.latitude = float_at(latitudes, idx);
        record.longitude = float_at(longitudes, idx);
        if let Some(extra) = string_at(extras, idx) {
            record.extra = serde_json::from_str(&extra)
                .with_context(|| format!("parsing extra fields for {}", record.race_url))?;
        }
        out.push(record);
    }
    Ok(out)
}
