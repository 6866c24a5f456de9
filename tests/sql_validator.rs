use std::sync::Arc;
use std::time::Duration;

use tabula::{Config, Tabula, TabulaError, TextModel, ValidationReason};

/// Model that always answers with a fixed string, standing in for a
/// misbehaving LLM.
struct ScriptedModel(&'static str);

impl TextModel for ScriptedModel {
    fn generate(&self, _prompt: &str) -> tabula::Result<String> {
        Ok(self.0.to_string())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn engine_with(dir: &tempfile::TempDir, sql: &'static str, config: Config) -> Tabula {
    let engine = Tabula::open_with_model(dir.path(), config, Arc::new(ScriptedModel(sql))).unwrap();
    let receipt = engine
        .submit_ingestion("acme", Some("sales"), b"region,amount\neu,10\nus,30\n")
        .unwrap();
    engine
        .wait_for_terminal("acme", "sales", receipt.version, Duration::from_secs(10))
        .unwrap();
    engine
}

fn rejection_reason(sql: &'static str) -> ValidationReason {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(&dir, sql, Config::default());
    let err = engine
        .submit_query("acme", "sales", None, "anything")
        .unwrap_err();
    match err {
        TabulaError::Validation(v) => v.reason,
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn mutations_are_rejected_as_not_a_select() {
    assert_eq!(
        rejection_reason("DELETE FROM \"sales\""),
        ValidationReason::NotASelect
    );
    assert_eq!(
        rejection_reason("DROP TABLE \"sales\""),
        ValidationReason::NotASelect
    );
}

#[test]
fn stacked_statements_are_rejected() {
    // The generator's cleanup already truncates at the first semicolon, so
    // exercise the validator directly with a stacked payload.
    use tabula::sql::{validate_sql, ResourceLimits};
    use tabula::{ColumnDef, ColumnType, Schema};

    let schema = Schema::new(vec![ColumnDef {
        name: "amount".to_string(),
        column_type: ColumnType::Integer,
    }]);
    let limits = ResourceLimits {
        max_rows: 1000,
        require_explicit_limit: false,
    };
    let err = validate_sql(
        "SELECT * FROM \"sales\"; DROP TABLE \"sales\"",
        "sales",
        &schema,
        &limits,
    )
    .unwrap_err();
    assert_eq!(err.reason, ValidationReason::MultipleStatements);
}

#[test]
fn unknown_columns_and_tables_are_rejected() {
    assert_eq!(
        rejection_reason("SELECT \"password\" FROM \"sales\" LIMIT 5"),
        ValidationReason::UnknownColumn
    );
    assert_eq!(
        rejection_reason("SELECT * FROM \"other_tenants_table\" LIMIT 5"),
        ValidationReason::UnknownColumn
    );
}

#[test]
fn off_list_functions_are_rejected() {
    assert_eq!(
        rejection_reason("SELECT randomblob(\"amount\") FROM \"sales\""),
        ValidationReason::DisallowedFunction
    );
}

#[test]
fn missing_limit_is_fatal_only_in_strict_mode() {
    let dir = tempfile::tempdir().unwrap();
    let strict = Config {
        require_explicit_limit: true,
        ..Config::default()
    };
    let engine = engine_with(&dir, "SELECT * FROM \"sales\"", strict);
    let err = engine
        .submit_query("acme", "sales", None, "anything")
        .unwrap_err();
    match err {
        TabulaError::Validation(v) => assert_eq!(v.reason, ValidationReason::MissingLimit),
        other => panic!("unexpected {other:?}"),
    }

    // default mode injects the cap instead
    let dir2 = tempfile::tempdir().unwrap();
    let engine = engine_with(&dir2, "SELECT * FROM \"sales\"", Config::default());
    let resp = engine
        .submit_query("acme", "sales", None, "anything")
        .unwrap();
    assert_eq!(resp.row_count, 2);
}

#[test]
fn oversized_limit_is_clamped_not_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(&dir, "SELECT * FROM \"sales\" LIMIT 99999999", Config::default());
    let resp = engine
        .submit_query("acme", "sales", None, "anything")
        .unwrap();
    assert_eq!(resp.row_count, 2);
}

#[test]
fn rejected_queries_land_in_the_query_log() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(&dir, "DELETE FROM \"sales\"", Config::default());
    let _ = engine.submit_query("acme", "sales", None, "wipe it");

    let history = engine.query_history("acme", "sales");
    assert_eq!(history.len(), 1);
    let rec = &history[0];
    assert_eq!(rec.status, tabula::QueryStatus::Failed);
    assert_eq!(rec.generated_sql.as_deref(), Some("DELETE FROM \"sales\""));
    assert!(rec.validation.as_deref().unwrap().contains("not-a-select"));
}
