use crate::error::{IngestionError, IngestionReason};
use crate::store::{ColumnDef, ColumnType, Schema, Value};
use crate::util::time::parse_timestamp;

#[derive(Debug, Clone)]
pub struct ParsedTable {
    pub schema: Schema,
    pub rows: Vec<Vec<Value>>,
}

/// Parse a CSV payload into a typed table.
///
/// The first record is the header. Column types are inferred from the first
/// `sample_rows` non-empty values per column; values past the sample window
/// that no longer convert become Null rather than failing the whole upload.
pub fn parse_csv(bytes: &[u8], sample_rows: usize) -> Result<ParsedTable, IngestionError> {
    let text = std::str::from_utf8(bytes).map_err(|e| {
        IngestionError::new(IngestionReason::Unparsable, format!("payload is not utf-8: {e}"))
    })?;

    let records = split_records(text)?;
    let mut records = records.into_iter();

    let header = records.next().ok_or_else(|| {
        IngestionError::new(IngestionReason::Empty, "payload has no header row")
    })?;
    if header.iter().all(|h| h.trim().is_empty()) {
        return Err(IngestionError::new(
            IngestionReason::Unparsable,
            "header row has no column names",
        ));
    }
    let names: Vec<String> = header
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let name = h.trim();
            if name.is_empty() {
                format!("col_{}", i + 1)
            } else {
                name.to_string()
            }
        })
        .collect();
    let width = names.len();

    let mut raw_rows: Vec<Vec<String>> = Vec::new();
    for (line_no, record) in records.enumerate() {
        if record.len() != width {
            return Err(IngestionError::new(
                IngestionReason::Unparsable,
                format!(
                    "row {} has {} fields, header has {}",
                    line_no + 2,
                    record.len(),
                    width
                ),
            ));
        }
        raw_rows.push(record);
    }

    if raw_rows.is_empty() {
        return Err(IngestionError::new(
            IngestionReason::Empty,
            "payload has a header but no data rows",
        ));
    }

    let mut columns = Vec::with_capacity(width);
    for (i, name) in names.iter().enumerate() {
        let ty = infer_column_type(raw_rows.iter().map(|r| r[i].as_str()), sample_rows);
        columns.push(ColumnDef {
            name: name.clone(),
            column_type: ty,
        });
    }
    let schema = Schema::new(columns);

    let rows = raw_rows
        .into_iter()
        .map(|record| {
            record
                .into_iter()
                .zip(schema.columns.iter())
                .map(|(field, col)| convert_field(&field, col.column_type))
                .collect()
        })
        .collect();

    Ok(ParsedTable { schema, rows })
}

/// Split CSV text into records. Handles quoted fields, doubled-quote
/// escapes, embedded newlines inside quotes, and CRLF line endings.
fn split_records(text: &str) -> Result<Vec<Vec<String>>, IngestionError> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();
    let mut saw_any = false;

    while let Some(c) = chars.next() {
        saw_any = true;
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => {
                record.push(std::mem::take(&mut field));
                // keep trailing empty field: ",\n" is two fields
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                record.push(std::mem::take(&mut field));
                push_record(&mut records, &mut record);
            }
            '\n' => {
                record.push(std::mem::take(&mut field));
                push_record(&mut records, &mut record);
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(IngestionError::new(
            IngestionReason::Unparsable,
            "unterminated quoted field",
        ));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        push_record(&mut records, &mut record);
    }
    if !saw_any {
        return Err(IngestionError::new(
            IngestionReason::Empty,
            "payload is empty",
        ));
    }
    Ok(records)
}

fn push_record(records: &mut Vec<Vec<String>>, record: &mut Vec<String>) {
    // skip fully blank lines
    if record.len() == 1 && record[0].is_empty() {
        record.clear();
        return;
    }
    records.push(std::mem::take(record));
}

/// Inference tries the narrowest type that fits every sampled value, in the
/// order boolean, integer, float, timestamp, falling back to text.
fn infer_column_type<'a>(
    values: impl Iterator<Item = &'a str>,
    sample_rows: usize,
) -> ColumnType {
    let sample: Vec<&str> = values
        .filter(|v| !v.trim().is_empty())
        .take(sample_rows)
        .collect();
    if sample.is_empty() {
        return ColumnType::Text;
    }
    for candidate in [
        ColumnType::Boolean,
        ColumnType::Integer,
        ColumnType::Float,
        ColumnType::Timestamp,
    ] {
        if sample.iter().all(|v| parses_as(v, candidate)) {
            return candidate;
        }
    }
    ColumnType::Text
}

fn parses_as(field: &str, ty: ColumnType) -> bool {
    let t = field.trim();
    match ty {
        ColumnType::Boolean => parse_bool(t).is_some(),
        ColumnType::Integer => t.parse::<i64>().is_ok(),
        ColumnType::Float => t.parse::<f64>().is_ok(),
        ColumnType::Timestamp => parse_timestamp(t).is_some(),
        ColumnType::Text => true,
    }
}

fn parse_bool(t: &str) -> Option<bool> {
    if t.eq_ignore_ascii_case("true") {
        Some(true)
    } else if t.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

fn convert_field(field: &str, ty: ColumnType) -> Value {
    let t = field.trim();
    if t.is_empty() {
        return Value::Null;
    }
    match ty {
        ColumnType::Text => Value::Text(field.to_string()),
        ColumnType::Boolean => parse_bool(t).map(Value::Boolean).unwrap_or(Value::Null),
        ColumnType::Integer => t.parse::<i64>().map(Value::Integer).unwrap_or(Value::Null),
        ColumnType::Float => t.parse::<f64>().map(Value::Float).unwrap_or(Value::Null),
        ColumnType::Timestamp => parse_timestamp(t).map(Value::Timestamp).unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_table_with_inference() {
        let csv = "region,amount,score,active\neu,10,1.5,true\nus,20,2.5,false\n";
        let table = parse_csv(csv.as_bytes(), 100).unwrap();
        let types: Vec<ColumnType> = table
            .schema
            .columns
            .iter()
            .map(|c| c.column_type)
            .collect();
        assert_eq!(
            types,
            vec![
                ColumnType::Text,
                ColumnType::Integer,
                ColumnType::Float,
                ColumnType::Boolean
            ]
        );
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][1], Value::Integer(10));
        assert_eq!(table.rows[1][3], Value::Boolean(false));
    }

    #[test]
    fn quoted_fields_and_crlf() {
        let csv = "name,note\r\n\"smith, jane\",\"said \"\"hi\"\"\"\r\nbob,plain\r\n";
        let table = parse_csv(csv.as_bytes(), 100).unwrap();
        assert_eq!(table.rows[0][0], Value::Text("smith, jane".to_string()));
        assert_eq!(table.rows[0][1], Value::Text("said \"hi\"".to_string()));
    }

    #[test]
    fn timestamp_column() {
        let csv = "day,total\n2024-01-01,5\n2024-01-02,7\n";
        let table = parse_csv(csv.as_bytes(), 100).unwrap();
        assert_eq!(table.schema.columns[0].column_type, ColumnType::Timestamp);
        assert!(matches!(table.rows[0][0], Value::Timestamp(_)));
    }

    #[test]
    fn empty_payload_is_empty_error() {
        let err = parse_csv(b"", 100).unwrap_err();
        assert_eq!(err.reason, IngestionReason::Empty);
        let err = parse_csv(b"a,b\n", 100).unwrap_err();
        assert_eq!(err.reason, IngestionReason::Empty);
    }

    #[test]
    fn ragged_rows_are_unparsable() {
        let err = parse_csv(b"a,b\n1,2,3\n", 100).unwrap_err();
        assert_eq!(err.reason, IngestionReason::Unparsable);
    }

    #[test]
    fn unterminated_quote_is_unparsable() {
        let err = parse_csv(b"a,b\n\"open,2\n", 100).unwrap_err();
        assert_eq!(err.reason, IngestionReason::Unparsable);
    }

    #[test]
    fn values_outside_sample_window_fall_back_to_null() {
        // Only the first 2 non-empty values drive inference, so "oops" in
        // an integer column becomes Null instead of failing the upload.
        let csv = "n\n1\n2\noops\n4\n";
        let table = parse_csv(csv.as_bytes(), 2).unwrap();
        assert_eq!(table.schema.columns[0].column_type, ColumnType::Integer);
        assert_eq!(table.rows[2][0], Value::Null);
        assert_eq!(table.rows[3][0], Value::Integer(4));
    }

    #[test]
    fn blank_header_names_get_placeholders() {
        let csv = "a,,c\n1,2,3\n";
        let table = parse_csv(csv.as_bytes(), 100).unwrap();
        assert_eq!(table.schema.columns[1].name, "col_2");
    }

    #[test]
    fn empty_fields_are_null() {
        let csv = "a,b\n1,\n,2\n";
        let table = parse_csv(csv.as_bytes(), 100).unwrap();
        assert_eq!(table.rows[0][1], Value::Null);
        assert_eq!(table.rows[1][0], Value::Null);
    }
}
