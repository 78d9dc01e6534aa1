//! SQL generation for target writes
//!
//! Builds the parameterised statements the target workers execute: single and
//! multi-row upserts (`INSERT … ON DUPLICATE KEY UPDATE`), primary-key
//! deletes, and the emptiness probe used by init loads. Identifiers are
//! backtick-quoted; values always travel as bind parameters.

use crate::error::{EtlError, EtlResult};
use crate::events::Row;
use mysql_async::Value;

/// Backtick-quote an identifier, doubling embedded backticks
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Convert a JSON row value into a bind parameter
pub fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::NULL,
        serde_json::Value::Bool(b) => Value::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else {
                Value::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Bytes(s.clone().into_bytes()),
        // Arrays and objects are stored as JSON text
        other => Value::Bytes(other.to_string().into_bytes()),
    }
}

/// Convert a MySQL value read from a source into its JSON row form
pub fn value_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::NULL => serde_json::Value::Null,
        Value::Bytes(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())
        }
        Value::Int(i) => serde_json::Value::from(i),
        Value::UInt(u) => serde_json::Value::from(u),
        Value::Float(f) => serde_json::Value::from(f as f64),
        Value::Double(d) => serde_json::Value::from(d),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let formatted = if hour == 0 && minute == 0 && second == 0 && micros == 0 {
                format!("{year:04}-{month:02}-{day:02}")
            } else if micros == 0 {
                format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}")
            } else {
                format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
                )
            };
            serde_json::Value::String(formatted)
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if negative { "-" } else { "" };
            let total_hours = u32::from(days) * 24 + u32::from(hours);
            let formatted = if micros == 0 {
                format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}")
            } else {
                format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}.{micros:06}")
            };
            serde_json::Value::String(formatted)
        }
    }
}

/// Build a single-row upsert: `INSERT … ON DUPLICATE KEY UPDATE`
pub fn build_upsert(table: &str, row: &Row, primary_key: &str) -> EtlResult<(String, Vec<Value>)> {
    build_batch_upsert(table, std::slice::from_ref(row), primary_key)
}

/// Build a multi-row upsert with one VALUES tuple per row.
///
/// The column set comes from the first row; later rows fill missing columns
/// with NULL. Non-PK columns get `col = VALUES(col)` update clauses; a
/// PK-only mapping degenerates to updating the key with itself.
pub fn build_batch_upsert(
    table: &str,
    rows: &[Row],
    primary_key: &str,
) -> EtlResult<(String, Vec<Value>)> {
    let first = rows
        .first()
        .ok_or_else(|| EtlError::generic("cannot build an upsert for zero rows"))?;
    if first.is_empty() {
        return Err(EtlError::generic("cannot build an upsert for an empty row"));
    }

    let columns: Vec<&String> = first.keys().collect();
    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let tuple = format!("({})", vec!["?"; columns.len()].join(", "));
    let tuples = vec![tuple; rows.len()].join(", ");

    let update_parts: Vec<String> = columns
        .iter()
        .filter(|c| c.as_str() != primary_key)
        .map(|c| format!("{0} = VALUES({0})", quote_ident(c)))
        .collect();
    let update_clause = if update_parts.is_empty() {
        format!("{0} = VALUES({0})", quote_ident(primary_key))
    } else {
        update_parts.join(", ")
    };

    let sql = format!(
        "INSERT INTO {} ({}) VALUES {} ON DUPLICATE KEY UPDATE {}",
        quote_ident(table),
        quoted.join(", "),
        tuples,
        update_clause
    );

    let mut params = Vec::with_capacity(columns.len() * rows.len());
    for row in rows {
        for column in &columns {
            params.push(
                row.get(column.as_str())
                    .map(json_to_value)
                    .unwrap_or(Value::NULL),
            );
        }
    }

    Ok((sql, params))
}

/// Build a primary-key DELETE
pub fn build_delete(
    table: &str,
    primary_key: &str,
    pk_value: &serde_json::Value,
) -> (String, Vec<Value>) {
    let sql = format!(
        "DELETE FROM {} WHERE {} = ?",
        quote_ident(table),
        quote_ident(primary_key)
    );
    (sql, vec![json_to_value(pk_value)])
}

/// Probe used by init loads to decide whether a target table is empty
pub fn build_emptiness_probe(table: &str) -> String {
    format!("SELECT 1 FROM {} LIMIT 1", quote_ident(table))
}
