//! Function evaluation for the in-memory store.
//!
//! Supports `NAME(arg, ...)` with an optional leading `=`, where each argument
//! is a number literal, a cell, a range, a row or a column. A bare reference
//! (`=B2`) evaluates to that cell.

use sheet_agents_core::{
    CellAddr, CellRange, CellValue, RefKind, SheetBounds, SpreadsheetRef, traits::StoreError,
};

/// Supported aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sum,
    Average,
    Min,
    Max,
    Count,
    CountA,
}

impl Function {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SUM" => Some(Self::Sum),
            "AVERAGE" => Some(Self::Average),
            "MIN" => Some(Self::Min),
            "MAX" => Some(Self::Max),
            "COUNT" => Some(Self::Count),
            "COUNTA" => Some(Self::CountA),
            _ => None,
        }
    }

    /// Apply to the flattened argument values.
    ///
    /// Numeric functions skip text, booleans and blanks the way spreadsheet
    /// ranges do.
    #[allow(clippy::cast_precision_loss)]
    fn apply(self, values: &[CellValue]) -> Result<CellValue, StoreError> {
        let numbers = values.iter().filter_map(CellValue::as_number);
        let result = match self {
            Self::Sum => numbers.sum::<f64>(),
            Self::Average => {
                let (sum, count) = numbers.fold((0.0, 0usize), |(s, c), n| (s + n, c + 1));
                if count == 0 {
                    return Err(StoreError::InvalidQuery(
                        "#DIV/0!: AVERAGE of no numbers".to_string(),
                    ));
                }
                sum / count as f64
            }
            Self::Min => numbers.reduce(f64::min).unwrap_or(0.0),
            Self::Max => numbers.reduce(f64::max).unwrap_or(0.0),
            Self::Count => numbers.count() as f64,
            Self::CountA => values.iter().filter(|v| !v.is_empty()).count() as f64,
        };
        Ok(CellValue::Number(result))
    }
}

/// Evaluate `query` against a sheet of `bounds`, reading cells via `lookup`.
///
/// # Errors
/// Returns [`StoreError::InvalidQuery`] for malformed input,
/// [`StoreError::UnsupportedFunction`] for unknown names and
/// [`StoreError::OutOfBounds`] for references outside the sheet.
pub fn evaluate(
    query: &str,
    bounds: SheetBounds,
    lookup: impl Fn(CellAddr) -> CellValue,
) -> Result<CellValue, StoreError> {
    let trimmed = query.trim();
    let body = trimmed.strip_prefix('=').unwrap_or(trimmed).trim();
    if body.is_empty() {
        return Err(StoreError::InvalidQuery("empty query".to_string()));
    }

    let Some(open) = body.find('(') else {
        let target = SpreadsheetRef::parse_as(RefKind::Cell, body)
            .map_err(|e| StoreError::InvalidQuery(e.to_string()))?;
        check(bounds, &target)?;
        let SpreadsheetRef::Cell(cell) = target else {
            return Err(StoreError::InvalidQuery(body.to_string()));
        };
        return Ok(lookup(cell));
    };

    let Some(args) = body[open + 1..].strip_suffix(')') else {
        return Err(StoreError::InvalidQuery(format!("unbalanced parentheses: {body}")));
    };
    let name = body[..open].trim();
    let function =
        Function::from_name(name).ok_or_else(|| StoreError::UnsupportedFunction(name.to_string()))?;

    let mut values = Vec::new();
    for arg in args.split(',').map(str::trim).filter(|a| !a.is_empty()) {
        if let Ok(n) = arg.parse::<f64>() {
            values.push(CellValue::Number(n));
            continue;
        }
        let target =
            SpreadsheetRef::parse(arg).map_err(|e| StoreError::InvalidQuery(e.to_string()))?;
        check(bounds, &target)?;
        values.extend(expand(bounds, target).cells().map(&lookup));
    }

    function.apply(&values)
}

fn check(bounds: SheetBounds, target: &SpreadsheetRef) -> Result<(), StoreError> {
    bounds
        .check(target)
        .map_err(|e| StoreError::OutOfBounds(e.to_string()))
}

fn expand(bounds: SheetBounds, target: SpreadsheetRef) -> CellRange {
    match target {
        SpreadsheetRef::Cell(cell) => CellRange {
            start: cell,
            end: cell,
        },
        SpreadsheetRef::Row(row) => CellRange::row_prefix(row, bounds.cols),
        SpreadsheetRef::Column(col) => CellRange::column_prefix(col, bounds.rows),
        SpreadsheetRef::Range(range) => range,
    }
}
