use std::path::{Path, PathBuf};

use fellmap_adapters::{fellrunner_adapter, parse_detail_html, DetailTarget, RaceSource};
use fellmap_core::RaceRecord;

fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/fellrunner")
        .join(name)
}

fn read_fixture(name: &str) -> String {
    std::fs::read_to_string(fixture_path(name)).expect("read fixture")
}

#[test]
fn listing_fixture_yields_absolute_race_links() {
    let adapter = fellrunner_adapter();
    let html = read_fixture("listing.html");
    let targets = fellmap_adapters::parse_listing_html(
        &html,
        &adapter.config().base_url,
        "https://races.fellrunner.org.uk/races",
    )
    .expect("parse listing");

    assert_eq!(
        targets,
        vec![
            DetailTarget {
                url: "https://races.fellrunner.org.uk/races/9001".into()
            },
            DetailTarget {
                url: "https://races.fellrunner.org.uk/races/9002".into()
            },
            DetailTarget {
                url: "https://races.fellrunner.org.uk/races/9003".into()
            },
        ]
    );
    assert_eq!(adapter.source_id(), "fellrunner");
}

#[test]
fn detail_fixture_maps_onto_a_typed_record() {
    let html = read_fixture("detail.html");
    let scraped = parse_detail_html(&html, "https://races.fellrunner.org.uk/races/9001")
        .expect("parse detail");
    assert_eq!(scraped.title, "Skiddaw Fell Race");
    assert_eq!(
        scraped.fields.get("date_&_time").map(String::as_str),
        Some("Saturday 11th May 2024 at 11:00")
    );

    let record = RaceRecord::from_scraped(scraped);
    assert_eq!(record.venue.as_deref(), Some("Crosthwaite Church, Keswick, CA12 5QE"));
    assert_eq!(record.distance.as_deref(), Some("9.5km / 5.9m"));
    assert_eq!(record.category.as_deref(), Some("AM"));
    assert_eq!(record.website.as_deref(), Some("https://skiddawfellrace.example"));
    assert_eq!(
        record.extra.get("grid_reference").map(String::as_str),
        Some("NY 258 242")
    );
    assert_eq!(record.latitude, None);
}
