//! Typed decoding of query results.

use localbase_core::errors::{Error, Result};

use crate::value::{FromSqlValue, SqlValue};

/// A struct that can be built from one result row.
///
/// `COLUMNS` lists the column names the decoder requires; extra result columns
/// are ignored.
///
/// ```ignore
/// struct Note { id: i64, body: Option<String> }
///
/// impl FromRow for Note {
///     const COLUMNS: &'static [&'static str] = &["id", "body"];
///
///     fn from_row(row: &RowView<'_>) -> Result<Self> {
///         Ok(Self { id: row.get("id")?, body: row.get("body")? })
///     }
/// }
/// ```
pub trait FromRow: Sized {
    const COLUMNS: &'static [&'static str];

    fn from_row(row: &RowView<'_>) -> Result<Self>;
}

/// Borrowed view of a single row with name-based access.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    columns: &'a [String],
    values: &'a [SqlValue],
}

impl<'a> RowView<'a> {
    pub(crate) fn new(columns: &'a [String], values: &'a [SqlValue]) -> Self {
        Self { columns, values }
    }

    pub fn value(&self, column: &str) -> Option<&'a SqlValue> {
        self.columns
            .iter()
            .position(|name| name == column)
            .and_then(|index| self.values.get(index))
    }

    pub fn get<V: FromSqlValue>(&self, column: &str) -> Result<V> {
        let value = self
            .value(column)
            .ok_or_else(|| Error::statement(format!("Column '{}' is not in the result", column)))?;
        V::from_sql_value(value)
            .map_err(|e| Error::statement(format!("Column '{}': {}", column, e)))
    }
}

/// Checks that every column `T` needs is present in `columns`.
pub(crate) fn validate_columns<T: FromRow>(columns: &[String]) -> Result<()> {
    let missing = T::COLUMNS
        .iter()
        .filter(|expected| !columns.iter().any(|actual| actual == *expected))
        .copied()
        .collect::<Vec<_>>();
    if missing.is_empty() {
        return Ok(());
    }
    Err(Error::statement(format!(
        "Result is missing columns required by {}: {}",
        std::any::type_name::<T>(),
        missing.join(", ")
    )))
}

pub(crate) fn decode_rows<T: FromRow>(columns: &[String], rows: &[Vec<SqlValue>]) -> Result<Vec<T>> {
    validate_columns::<T>(columns)?;
    rows.iter()
        .map(|values| T::from_row(&RowView::new(columns, values)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Note {
        id: i64,
        body: Option<String>,
    }

    impl FromRow for Note {
        const COLUMNS: &'static [&'static str] = &["id", "body"];

        fn from_row(row: &RowView<'_>) -> Result<Self> {
            Ok(Self {
                id: row.get("id")?,
                body: row.get("body")?,
            })
        }
    }

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn decodes_by_name_regardless_of_order() {
        let cols = columns(&["body", "id", "extra"]);
        let rows = vec![
            vec![SqlValue::from("hi"), SqlValue::Integer(1), SqlValue::Null],
            vec![SqlValue::Null, SqlValue::Integer(2), SqlValue::Null],
        ];
        let notes = decode_rows::<Note>(&cols, &rows).expect("decode");
        assert_eq!(
            notes,
            vec![
                Note {
                    id: 1,
                    body: Some("hi".to_string())
                },
                Note { id: 2, body: None }
            ]
        );
    }

    #[test]
    fn missing_columns_are_reported_before_decoding() {
        let err = decode_rows::<Note>(&columns(&["id"]), &[]).expect_err("missing body");
        assert!(matches!(err, Error::Statement(ref msg) if msg.contains("body")));
    }

    #[test]
    fn type_mismatch_names_the_column() {
        let cols = columns(&["id", "body"]);
        let rows = vec![vec![SqlValue::from("one"), SqlValue::Null]];
        let err = decode_rows::<Note>(&cols, &rows).expect_err("text id");
        assert!(matches!(err, Error::Statement(ref msg) if msg.contains("'id'")));
    }
}
