use std::time::Duration;

use tabula::{Config, Tabula, TabulaError, Value};

const V1_CSV: &str = "city,pop\nparis,100\nlyon,50\n";
const V2_CSV: &str = "city,pop\nparis,100\nlyon,50\nnice,25\n";

fn engine_with_two_versions(dir: &tempfile::TempDir) -> Tabula {
    let engine = Tabula::open(dir.path(), Config::default()).unwrap();
    for csv in [V1_CSV, V2_CSV] {
        let receipt = engine
            .submit_ingestion("acme", Some("cities"), csv.as_bytes())
            .unwrap();
        engine
            .wait_for_terminal("acme", "cities", receipt.version, Duration::from_secs(10))
            .unwrap();
    }
    engine
}

#[test]
fn default_query_uses_latest_ready_version() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with_two_versions(&dir);

    let resp = engine
        .submit_query("acme", "cities", None, "how many cities?")
        .unwrap();
    assert_eq!(resp.version_used, 2);
    assert_eq!(resp.raw_answer, "count(*): 3");
}

#[test]
fn pinned_version_sees_old_data_after_newer_upload() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with_two_versions(&dir);

    let resp = engine
        .submit_query("acme", "cities", Some(1), "how many cities?")
        .unwrap();
    assert_eq!(resp.version_used, 1);
    assert_eq!(resp.raw_answer, "count(*): 2");
}

#[test]
fn pinning_a_missing_version_fails() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with_two_versions(&dir);

    let err = engine
        .submit_query("acme", "cities", Some(9), "how many cities?")
        .unwrap_err();
    assert!(matches!(err, TabulaError::NotFound(_)));
}

#[test]
fn preview_rows_come_from_the_pinned_version() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with_two_versions(&dir);

    let resp = engine
        .submit_query("acme", "cities", Some(1), "show me everything")
        .unwrap();
    assert_eq!(resp.preview.rows.len(), 2);
    assert!(resp
        .preview
        .rows
        .iter()
        .all(|r| r[0] != Value::Text("nice".to_string())));
}
