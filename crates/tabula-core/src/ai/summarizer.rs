use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ai::{call_with_timeout, TextModel};
use crate::error::{SummarizationError, SummarizationReason};
use crate::sql::QueryOutput;
use crate::store::{ColumnType, Schema, Value};

const SUMMARY_PROMPT_TEMPLATE: &str = r#"You are summarizing a query result for a business user.

Question: {question}
Result columns: {columns}
Result rows ({row_count} shown):
{rows}

Answer the question in one or two plain sentences based only on the rows above."#;

const SUMMARY_PROMPT_ROWS: usize = 20;

/// Produces the final natural-language answer. Without a model it runs a
/// deterministic synthesis over the result; with one it prompts the model
/// and falls back on the caller side when that fails.
pub struct Summarizer {
    model: Option<Arc<dyn TextModel>>,
    timeout: Duration,
    max_chars: usize,
}

impl Summarizer {
    pub fn new(model: Option<Arc<dyn TextModel>>, timeout: Duration, max_chars: usize) -> Self {
        Self {
            model,
            timeout,
            max_chars,
        }
    }

    /// `deadline` is the overall budget for the whole query; the stage
    /// timeout never extends past it.
    pub fn summarize(
        &self,
        question: &str,
        schema: &Schema,
        output: &QueryOutput,
        deadline: Instant,
    ) -> std::result::Result<String, SummarizationError> {
        let answer = match &self.model {
            None => native_summary(schema, output),
            Some(model) => {
                let prompt = build_summary_prompt(question, output);
                let timeout = self
                    .timeout
                    .min(deadline.saturating_duration_since(Instant::now()));
                match call_with_timeout(Arc::clone(model), prompt, timeout) {
                    None => {
                        return Err(SummarizationError::new(
                            SummarizationReason::Timeout,
                            format!("model did not answer within {timeout:?}"),
                        ))
                    }
                    Some(Err(e)) => {
                        return Err(SummarizationError::new(
                            SummarizationReason::Malformed,
                            e.to_string(),
                        ))
                    }
                    Some(Ok(text)) if text.trim().is_empty() => {
                        return Err(SummarizationError::new(
                            SummarizationReason::Malformed,
                            "model returned an empty summary",
                        ))
                    }
                    Some(Ok(text)) => text.trim().to_string(),
                }
            }
        };
        Ok(truncate_chars(&answer, self.max_chars))
    }

    /// Template answer used verbatim when summarization is skipped or fails.
    pub fn raw_answer(&self, output: &QueryOutput) -> String {
        truncate_chars(&raw_answer(output), self.max_chars)
    }
}

pub fn raw_answer(output: &QueryOutput) -> String {
    if output.rows.is_empty() {
        return "No results found.".to_string();
    }
    if output.rows.len() == 1 && output.columns.len() == 1 {
        return format!("{}: {}", output.columns[0], output.rows[0][0].render());
    }
    format!("Found {} results.", output.rows.len())
}

fn build_summary_prompt(question: &str, output: &QueryOutput) -> String {
    let mut rows_block = String::new();
    for row in output.rows.iter().take(SUMMARY_PROMPT_ROWS) {
        rows_block.push_str(
            &row.iter().map(Value::render).collect::<Vec<_>>().join(", "),
        );
        rows_block.push('\n');
    }
    if rows_block.is_empty() {
        rows_block.push_str("(no rows)\n");
    }
    SUMMARY_PROMPT_TEMPLATE
        .replace("{question}", question)
        .replace("{columns}", &output.columns.join(", "))
        .replace("{row_count}", &output.rows.len().min(SUMMARY_PROMPT_ROWS).to_string())
        .replace("{rows}", rows_block.trim_end())
}

/// Model-free summary: a sentence about the shape of the result, plus basic
/// statistics for the first numeric column and a trend note when the result
/// carries a timestamp column.
fn native_summary(schema: &Schema, output: &QueryOutput) -> String {
    if output.rows.is_empty() {
        return "No rows matched the query.".to_string();
    }
    if output.rows.len() == 1 && output.columns.len() == 1 {
        return format!("{}: {}", output.columns[0], output.rows[0][0].render());
    }

    let mut parts = vec![format!("Found {} rows.", output.rows.len())];

    if let Some((name, idx)) = first_column_of(schema, output, ColumnType::is_numeric) {
        let nums: Vec<f64> = output
            .rows
            .iter()
            .filter_map(|r| r[idx].as_f64())
            .collect();
        if !nums.is_empty() {
            let min = nums.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = nums.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let avg = nums.iter().sum::<f64>() / nums.len() as f64;
            parts.push(format!(
                "{name} ranges from {} to {} (average {:.2}).",
                Value::Float(min).render(),
                Value::Float(max).render(),
                avg
            ));
            if let Some(trend) =
                trend_note(schema, output, &name, idx)
            {
                parts.push(trend);
            }
        }
    }

    parts.join(" ")
}

fn first_column_of(
    schema: &Schema,
    output: &QueryOutput,
    pred: impl Fn(&ColumnType) -> bool,
) -> Option<(String, usize)> {
    output.columns.iter().enumerate().find_map(|(i, name)| {
        let ty = schema.column_type(name)?;
        if pred(&ty) {
            Some((name.clone(), i))
        } else {
            None
        }
    })
}

/// Compare the numeric column's average over the first and second half of
/// the rows, ordered by the first timestamp column.
fn trend_note(
    schema: &Schema,
    output: &QueryOutput,
    numeric_name: &str,
    numeric_idx: usize,
) -> Option<String> {
    let (_, ts_idx) =
        first_column_of(schema, output, |ty| matches!(ty, ColumnType::Timestamp))?;
    if output.rows.len() < 4 {
        return None;
    }

    let mut ordered: Vec<&Vec<Value>> = output.rows.iter().collect();
    ordered.sort_by(|a, b| a[ts_idx].cmp_for_sort(&b[ts_idx]));

    let half = ordered.len() / 2;
    let avg_of = |rows: &[&Vec<Value>]| -> Option<f64> {
        let nums: Vec<f64> = rows.iter().filter_map(|r| r[numeric_idx].as_f64()).collect();
        if nums.is_empty() {
            None
        } else {
            Some(nums.iter().sum::<f64>() / nums.len() as f64)
        }
    };
    let early = avg_of(&ordered[..half])?;
    let late = avg_of(&ordered[half..])?;

    if late > early * 1.05 {
        Some(format!("{numeric_name} is trending up over time."))
    } else if late < early * 0.95 {
        Some(format!("{numeric_name} is trending down over time."))
    } else {
        None
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}
