//! Static map page: one toggleable marker layer per calendar month.

use std::path::Path;

use anyhow::{Context, Result};
use askama::Template;
use fellmap_core::{RaceRecord, RaceTable, MONTH_NAMES};
use fellmap_storage::write_atomic;
use serde::Serialize;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "fellmap-web";

const PAGE_TITLE: &str = "Fell races";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapMarker {
    pub latitude: f64,
    pub longitude: f64,
    pub title: String,
    pub distance: Option<String>,
    pub website: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthLayer {
    pub name: &'static str,
    pub markers: Vec<MapMarker>,
}

/// `[[south, west], [north, east]]`, the shape Leaflet's `fitBounds` takes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MapBounds(pub [[f64; 2]; 2]);

impl MapBounds {
    fn around(latitude: f64, longitude: f64) -> Self {
        Self([[latitude, longitude], [latitude, longitude]])
    }

    fn extend(&mut self, latitude: f64, longitude: f64) {
        let [sw, ne] = &mut self.0;
        sw[0] = sw[0].min(latitude);
        sw[1] = sw[1].min(longitude);
        ne[0] = ne[0].max(latitude);
        ne[1] = ne[1].max(longitude);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthLayers {
    pub layers: Vec<MonthLayer>,
    pub bounds: Option<MapBounds>,
}

impl MonthLayers {
    pub fn marker_count(&self) -> usize {
        self.layers.iter().map(|l| l.markers.len()).sum()
    }

    pub fn layer(&self, name: &str) -> Option<&MonthLayer> {
        self.layers.iter().find(|l| l.name == name)
    }
}

fn marker_for(record: &RaceRecord) -> Option<(usize, MapMarker)> {
    let (latitude, longitude) = (record.latitude?, record.longitude?);
    let month = record.month.as_deref()?;
    let idx = MONTH_NAMES.iter().position(|m| *m == month)?;
    Some((
        idx,
        MapMarker {
            latitude,
            longitude,
            title: record.title.clone(),
            distance: record.distance.clone(),
            website: record.website.clone(),
        },
    ))
}

/// Sort placed races into the twelve month layers. Races with no coordinates
/// or no recognised month are left off the map.
pub fn group_by_month(table: &RaceTable) -> MonthLayers {
    let mut layers = MONTH_NAMES
        .iter()
        .map(|&name| MonthLayer {
            name,
            markers: Vec::new(),
        })
        .collect::<Vec<_>>();
    let mut bounds: Option<MapBounds> = None;
    let (mut unplaced, mut undated) = (0usize, 0usize);

    for record in table {
        if !record.has_location() {
            unplaced += 1;
            continue;
        }
        let Some((idx, marker)) = marker_for(record) else {
            undated += 1;
            continue;
        };
        match bounds.as_mut() {
            Some(b) => b.extend(marker.latitude, marker.longitude),
            None => bounds = Some(MapBounds::around(marker.latitude, marker.longitude)),
        }
        layers[idx].markers.push(marker);
    }
    if unplaced + undated > 0 {
        debug!(unplaced, undated, "races left off the map");
    }

    MonthLayers { layers, bounds }
}

#[derive(Template)]
#[template(path = "map.html")]
struct MapTemplate<'a> {
    page_title: &'a str,
    payload_json: String,
}

/// JSON that is safe to inline inside a `<script>` element.
fn script_json<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value).context("serializing map layers")?;
    Ok(json.replace("</", "<\\/"))
}

pub fn render_map(layers: &MonthLayers) -> Result<String> {
    let tpl = MapTemplate {
        page_title: PAGE_TITLE,
        payload_json: script_json(layers)?,
    };
    tpl.render()
        .map_err(|err| anyhow::anyhow!(err.to_string()))
        .context("rendering map.html")
}

pub async fn write_map(path: &Path, html: &str) -> Result<()> {
    write_atomic(path, html.as_bytes()).await?;
    info!(path = %path.display(), bytes = html.len(), "map written");
    Ok(())
}

/// Group, render and write in one step.
pub async fn publish_map(table: &RaceTable, path: &Path) -> Result<MonthLayers> {
    let layers = group_by_month(table);
    let html = render_map(&layers)?;
    write_map(path, &html).await?;
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn placed(url: &str, month: &str, lat: f64, lon: f64) -> RaceRecord {
        let mut record = RaceRecord::new(url, format!("Race {url}"));
        record.month = Some(month.to_string());
        record.latitude = Some(lat);
        record.longitude = Some(lon);
        record.distance = Some("8km".into());
        record.website = Some(url.to_string());
        record
    }

    #[test]
    fn march_race_lands_in_march_layer() {
        let table = RaceTable::from_records(vec![placed("https://x/1", "March", 54.6, -3.1)]);
        let layers = group_by_month(&table);

        assert_eq!(layers.layers.len(), 12);
        assert_eq!(layers.marker_count(), 1);
        let march = layers.layer("March").unwrap();
        assert_eq!(march.markers[0].title, "Race https://x/1");
        assert!(layers.layer("April").unwrap().markers.is_empty());
        assert_eq!(layers.bounds, Some(MapBounds([[54.6, -3.1], [54.6, -3.1]])));
    }

    #[test]
    fn unplaced_or_undated_races_are_skipped() {
        let mut no_coords = placed("https://x/2", "May", 0.0, 0.0);
        no_coords.latitude = None;
        let mut no_month = placed("https://x/3", "May", 54.0, -2.0);
        no_month.month = None;
        let odd_month = placed("https://x/4", "Maytime", 54.0, -2.0);
        let table = RaceTable::from_records(vec![no_coords, no_month, odd_month]);

        let layers = group_by_month(&table);
        assert_eq!(layers.marker_count(), 0);
        assert_eq!(layers.bounds, None);
        assert_eq!(layers.layers.len(), 12);
    }

    #[test]
    fn bounds_cover_every_marker() {
        let table = RaceTable::from_records(vec![
            placed("https://x/1", "January", 54.6, -3.1),
            placed("https://x/2", "July", 53.1, -4.0),
            placed("https://x/3", "July", 57.0, -5.0),
        ]);
        let layers = group_by_month(&table);
        assert_eq!(layers.bounds, Some(MapBounds([[53.1, -5.0], [57.0, -3.1]])));
        assert_eq!(layers.layer("July").unwrap().markers.len(), 2);
    }

    #[test]
    fn rendered_page_names_every_month_and_escapes_script_breakouts() {
        let mut record = placed("https://x/1", "March", 54.6, -3.1);
        record.title = "</script><b>Sneaky</b>".into();
        let html = render_map(&group_by_month(&RaceTable::from_records(vec![record]))).unwrap();

        for month in MONTH_NAMES {
            assert!(html.contains(&format!("\"{month}\"")), "missing {month}");
        }
        assert!(html.contains("L.control.layers"));
        assert!(html.contains("document.createTextNode(marker.website)"));
        assert!(html.contains(r#""website":"https://x/1""#));
        assert!(!html.contains("</script><b>"));
        assert!(html.contains("<\\/script><b>Sneaky<\\/b>"));
    }

    #[tokio::test]
    async fn publish_writes_the_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("www/index.html");
        let table = RaceTable::from_records(vec![placed("https://x/1", "June", 54.6, -3.1)]);

        let layers = publish_map(&table, &path).await.unwrap();
        assert_eq!(layers.marker_count(), 1);
        let html = std::fs::read_to_string(&path).unwrap();
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("Race https://x/1"));
    }
}
