//! Cell values as they travel between clients, agents and the store.

use serde::{Deserialize, Serialize};

/// Content of a single cell.
///
/// Untagged on the wire: `null`, `5`, `true`, `"text"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Bool(bool),
    Text(String),
    #[default]
    Empty,
}

impl CellValue {
    /// Interpret typed-in text the way a spreadsheet does on entry.
    #[must_use]
    pub fn parse_input(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Self::Empty;
        }
        if trimmed.eq_ignore_ascii_case("true") {
            return Self::Bool(true);
        }
        if trimmed.eq_ignore_ascii_case("false") {
            return Self::Bool(false);
        }
        match trimmed.parse::<f64>() {
            Ok(n) if n.is_finite() => Self::Number(n),
            _ => Self::Text(text.to_string()),
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    #[must_use]
    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Result of a read: one cell, a row/column, or a range grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Scalar(CellValue),
    List(Vec<CellValue>),
    Grid(Vec<Vec<CellValue>>),
}

impl From<CellValue> for Value {
    fn from(v: CellValue) -> Self {
        Self::Scalar(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(CellValue::parse_input("5"), CellValue::Number(5.0));
        assert_eq!(CellValue::parse_input(" -2.5 "), CellValue::Number(-2.5));
        assert_eq!(CellValue::parse_input("TRUE"), CellValue::Bool(true));
        assert_eq!(CellValue::parse_input(""), CellValue::Empty);
        assert_eq!(
            CellValue::parse_input("Revenue"),
            CellValue::Text("Revenue".into())
        );
        // Not finite, kept as text.
        assert_eq!(CellValue::parse_input("inf"), CellValue::Text("inf".into()));
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_string(&vec![
            CellValue::Number(5.0),
            CellValue::Bool(false),
            CellValue::Text("x".into()),
            CellValue::Empty,
        ])
        .unwrap();
        assert_eq!(json, r#"[5.0,false,"x",null]"#);

        let parsed: Vec<CellValue> = serde_json::from_str("[5, null, \"y\"]").unwrap();
        assert_eq!(
            parsed,
            [CellValue::Number(5.0), CellValue::Empty, CellValue::Text("y".into())]
        );
    }

    #[test]
    fn test_value_grid_decodes_as_grid() {
        let value: Value = serde_json::from_str("[[1, 2], [3, null]]").unwrap();
        assert!(matches!(value, Value::Grid(rows) if rows.len() == 2));

        let value: Value = serde_json::from_str("[1, 2]").unwrap();
        assert!(matches!(value, Value::List(cells) if cells.len() == 2));
    }
}
