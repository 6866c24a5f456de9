use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::ai::{call_with_timeout, TextModel};
use crate::error::{GenerationError, GenerationReason, Result};
use crate::store::{Schema, Value};

const PROMPT_TEMPLATE: &str = r#"You are a SQL translator for a read-only tabular query engine.

Table: {table}
Columns:
{columns}

Sample rows:
{samples}

Rules:
- Output a single SELECT statement and nothing else.
- Quote column and table names with double quotes.
- Never modify data; only SELECT is accepted.
- Always end with LIMIT {max_rows} unless the query is a single aggregate.
- If unsure, fall back to: SELECT * FROM "{table}" LIMIT 10

Question: {question}"#;

/// Turns a natural-language question into candidate SQL via the configured
/// model backend. The output is untrusted; the validator decides what runs.
pub struct SqlGenerator {
    model: Arc<dyn TextModel>,
    timeout: Duration,
}

impl SqlGenerator {
    pub fn new(model: Arc<dyn TextModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    /// `deadline` is the overall budget for the whole query; the stage
    /// timeout never extends past it.
    pub fn generate_sql(
        &self,
        question: &str,
        table: &str,
        schema: &Schema,
        samples: &[Vec<Value>],
        max_rows: u64,
        deadline: Instant,
    ) -> std::result::Result<String, GenerationError> {
        let prompt = build_prompt(question, table, schema, samples, max_rows);
        debug!(model = self.model.name(), "generating sql");

        let timeout = self
            .timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        let outcome = call_with_timeout(Arc::clone(&self.model), prompt, timeout);
        let raw = match outcome {
            None => {
                return Err(GenerationError::new(
                    GenerationReason::Timeout,
                    format!("model did not answer within {timeout:?}"),
                ))
            }
            Some(Err(e)) => {
                return Err(GenerationError::new(
                    GenerationReason::Refused,
                    e.to_string(),
                ))
            }
            Some(Ok(raw)) => raw,
        };

        let sql = clean_sql_output(&raw);
        if sql.is_empty() {
            return Err(GenerationError::new(
                GenerationReason::Malformed,
                "model returned empty SQL",
            ));
        }
        Ok(sql)
    }
}

/// Safe statement used when generation fails outright.
pub fn fallback_sql(table: &str) -> String {
    format!("SELECT * FROM \"{table}\" LIMIT 10")
}

pub fn build_prompt(
    question: &str,
    table: &str,
    schema: &Schema,
    samples: &[Vec<Value>],
    max_rows: u64,
) -> String {
    let mut sample_lines = String::new();
    for row in samples {
        let line = row.iter().map(Value::render).collect::<Vec<_>>().join(", ");
        sample_lines.push_str(&line);
        sample_lines.push('\n');
    }
    if sample_lines.is_empty() {
        sample_lines.push_str("(none)\n");
    }

    PROMPT_TEMPLATE
        .replace("{table}", table)
        .replace("{columns}", &schema.describe())
        .replace("{samples}", sample_lines.trim_end())
        .replace("{max_rows}", &max_rows.to_string())
        .replace("{question}", question)
}

/// Strip markdown fences and keep only the first statement.
pub fn clean_sql_output(raw: &str) -> String {
    let mut s = raw.trim().to_string();

    if s.starts_with("```sql") {
        s = s.strip_prefix("```sql").unwrap_or(&s).to_string();
    } else if s.starts_with("```") {
        s = s.strip_prefix("```").unwrap_or(&s).to_string();
    }
    if s.ends_with("```") {
        s = s.strip_suffix("```").unwrap_or(&s).to_string();
    }

    let s = s.trim();

    if let Some(pos) = s.find(';') {
        s[..=pos].trim().to_string()
    } else {
        s.to_string()
    }
}

/// Deterministic model used when no GGUF model is configured. It reads the
/// table name, column list, and question back out of the prompt and applies
/// keyword rules, which is enough for smoke tests and offline use.
#[derive(Debug, Default)]
pub struct HeuristicModel;

impl TextModel for HeuristicModel {
    fn generate(&self, prompt: &str) -> Result<String> {
        Ok(heuristic_sql(prompt))
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

fn heuristic_sql(prompt: &str) -> String {
    let table = prompt
        .lines()
        .find_map(|l| l.strip_prefix("Table: "))
        .unwrap_or("data")
        .trim()
        .to_string();

    // column lines look like `- name (type)`
    let mut columns: Vec<(String, String)> = Vec::new();
    for line in prompt.lines() {
        let Some(rest) = line.strip_prefix("- ") else {
            continue;
        };
        if let Some((name, ty)) = rest.rsplit_once(" (") {
            columns.push((name.trim().to_string(), ty.trim_end_matches(')').to_string()));
        }
    }

    let question = prompt
        .lines()
        .rev()
        .find_map(|l| l.strip_prefix("Question: "))
        .unwrap_or("")
        .to_ascii_lowercase();

    let numeric = pick_column(&question, &columns, &["integer", "float"]);

    if question.contains("how many") || question.contains("count") {
        return format!("SELECT count(*) FROM \"{table}\"");
    }
    if question.contains("average") || question.contains("mean") {
        if let Some(col) = &numeric {
            return format!("SELECT avg(\"{col}\") FROM \"{table}\"");
        }
    }
    if question.contains("total") || question.contains("sum") {
        if let Some(col) = &numeric {
            return format!("SELECT sum(\"{col}\") FROM \"{table}\"");
        }
    }
    if question.contains("highest") || question.contains("maximum") || question.contains("max ") {
        if let Some(col) = &numeric {
            return format!("SELECT max(\"{col}\") FROM \"{table}\"");
        }
    }
    if question.contains("lowest") || question.contains("minimum") || question.contains("min ") {
        if let Some(col) = &numeric {
            return format!("SELECT min(\"{col}\") FROM \"{table}\"");
        }
    }
    if let Some(n) = parse_top_n(&question) {
        if let Some(col) = &numeric {
            return format!(
                "SELECT * FROM \"{table}\" ORDER BY \"{col}\" DESC LIMIT {n}"
            );
        }
    }

    fallback_sql(&table)
}

/// Prefer a column whose name appears in the question, then any column of a
/// wanted type.
fn pick_column(
    question: &str,
    columns: &[(String, String)],
    wanted_types: &[&str],
) -> Option<String> {
    columns
        .iter()
        .filter(|(_, ty)| wanted_types.contains(&ty.as_str()))
        .find(|(name, _)| question.contains(&name.to_ascii_lowercase()))
        .or_else(|| {
            columns
                .iter()
                .find(|(_, ty)| wanted_types.contains(&ty.as_str()))
        })
        .map(|(name, _)| name.clone())
}

fn parse_top_n(question: &str) -> Option<u64> {
    let rest = question.split("top ").nth(1)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ColumnDef, ColumnType};

    fn schema() -> Schema {
        Schema::new(vec![
            ColumnDef {
                name: "region".to_string(),
                column_type: ColumnType::Text,
            },
            ColumnDef {
                name: "amount".to_string(),
                column_type: ColumnType::Integer,
            },
            ColumnDef {
                name: "score".to_string(),
                column_type: ColumnType::Float,
            },
        ])
    }

    fn ask(question: &str) -> String {
        let prompt = build_prompt(question, "sales", &schema(), &[], 1000);
        heuristic_sql(&prompt)
    }

    #[test]
    fn clean_sql_strips_fences() {
        assert_eq!(
            clean_sql_output("```sql\nSELECT * FROM t;\n```"),
            "SELECT * FROM t;"
        );
    }

    #[test]
    fn clean_sql_takes_first_statement() {
        assert_eq!(clean_sql_output("SELECT 1; SELECT 2;"), "SELECT 1;");
    }

    #[test]
    fn clean_sql_handles_no_semicolon() {
        assert_eq!(clean_sql_output("SELECT count(*) FROM t"), "SELECT count(*) FROM t");
    }

    #[test]
    fn count_questions_become_count_star() {
        assert_eq!(ask("How many orders are there?"), "SELECT count(*) FROM \"sales\"");
    }

    #[test]
    fn average_picks_the_mentioned_column() {
        assert_eq!(
            ask("What is the average score?"),
            "SELECT avg(\"score\") FROM \"sales\""
        );
        assert_eq!(
            ask("What is the average amount?"),
            "SELECT avg(\"amount\") FROM \"sales\""
        );
    }

    #[test]
    fn top_n_orders_by_numeric_column() {
        assert_eq!(
            ask("Show the top 3 rows by amount"),
            "SELECT * FROM \"sales\" ORDER BY \"amount\" DESC LIMIT 3"
        );
    }

    #[test]
    fn unknown_questions_fall_back_to_preview() {
        assert_eq!(ask("Tell me something interesting"), fallback_sql("sales"));
    }

    #[test]
    fn prompt_carries_schema_and_samples() {
        let samples = vec![vec![
            Value::Text("eu".to_string()),
            Value::Integer(10),
            Value::Float(1.5),
        ]];
        let prompt = build_prompt("how many?", "sales", &schema(), &samples, 500);
        assert!(prompt.contains("Table: sales"));
        assert!(prompt.contains("- amount (integer)"));
        assert!(prompt.contains("eu, 10, 1.5"));
        assert!(prompt.contains("LIMIT 500"));
        assert!(prompt.ends_with("Question: how many?"));
    }

    #[test]
    fn generator_maps_timeout() {
        struct Stuck;
        impl TextModel for Stuck {
            fn generate(&self, _p: &str) -> Result<String> {
                std::thread::sleep(Duration::from_secs(5));
                Ok(String::new())
            }
        }
        let gen = SqlGenerator::new(Arc::new(Stuck), Duration::from_millis(20));
        let err = gen
            .generate_sql("how many?", "sales", &schema(), &[], 1000, far_deadline())
            .unwrap_err();
        assert_eq!(err.reason, GenerationReason::Timeout);
    }

    #[test]
    fn overall_deadline_caps_the_stage_timeout() {
        struct Slowish;
        impl TextModel for Slowish {
            fn generate(&self, _p: &str) -> Result<String> {
                std::thread::sleep(Duration::from_millis(300));
                Ok("SELECT 1".to_string())
            }
        }
        // generous stage timeout, but the overall deadline is nearly spent
        let gen = SqlGenerator::new(Arc::new(Slowish), Duration::from_secs(10));
        let start = Instant::now();
        let err = gen
            .generate_sql(
                "how many?",
                "sales",
                &schema(),
                &[],
                1000,
                Instant::now() + Duration::from_millis(20),
            )
            .unwrap_err();
        assert_eq!(err.reason, GenerationReason::Timeout);
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn generator_maps_empty_output_to_malformed() {
        struct Blank;
        impl TextModel for Blank {
            fn generate(&self, _p: &str) -> Result<String> {
                Ok("```\n```".to_string())
            }
        }
        let gen = SqlGenerator::new(Arc::new(Blank), Duration::from_secs(1));
        let err = gen
            .generate_sql("how many?", "sales", &schema(), &[], 1000, far_deadline())
            .unwrap_err();
        assert_eq!(err.reason, GenerationReason::Malformed);
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }
}
