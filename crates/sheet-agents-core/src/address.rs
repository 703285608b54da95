//! A1-style addressing into the spreadsheet.
//!
//! A [`SpreadsheetRef`] is a value, not an owned entity: it is parsed from
//! client text, then checked against the store's [`SheetBounds`] at the
//! moment it is used.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Absolute column limit (`XFD`).
pub const MAX_COLS: u32 = 16_384;

/// Absolute row limit.
pub const MAX_ROWS: u32 = 1_048_576;

/// Kind of address a command expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Cell,
    Row,
    Column,
    Range,
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cell => "cell",
            Self::Row => "row",
            Self::Column => "column",
            Self::Range => "range",
        };
        f.write_str(name)
    }
}

/// Address parse or resolution error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Address is empty")]
    Empty,
    #[error("Malformed address: {0}")]
    Malformed(String),
    #[error("Address exceeds sheet limits: {0}")]
    BeyondLimits(String),
    #[error("Range start must be top-left of its end: {0}")]
    Inverted(String),
    #[error("Expected a {expected} address, got {found}")]
    WrongKind { expected: RefKind, found: String },
    #[error("Address {address} is outside the sheet ({rows} rows x {cols} columns)")]
    OutOfBounds { address: String, rows: u32, cols: u32 },
}

/// A single cell (0-based coordinates).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellAddr {
    pub row: u32,
    pub col: u32,
}

impl CellAddr {
    #[must_use]
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for CellAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", col_to_letters(self.col), self.row + 1)
    }
}

/// Inclusive rectangle of cells, `start` is top-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellRange {
    pub start: CellAddr,
    pub end: CellAddr,
}

impl CellRange {
    /// Create a range, rejecting an inverted rectangle.
    ///
    /// # Errors
    /// Returns [`AddressError::Inverted`] if `start` is not top-left of `end`.
    pub fn new(start: CellAddr, end: CellAddr) -> Result<Self, AddressError> {
        if start.row > end.row || start.col > end.col {
            return Err(AddressError::Inverted(format!("{start}:{end}")));
        }
        Ok(Self { start, end })
    }

    /// Range covering `len` cells of one row, starting at the first column.
    #[must_use]
    pub fn row_prefix(row: u32, len: u32) -> Self {
        Self {
            start: CellAddr::new(row, 0),
            end: CellAddr::new(row, len.saturating_sub(1)),
        }
    }

    /// Range covering `len` cells of one column, starting at the first row.
    #[must_use]
    pub fn column_prefix(col: u32, len: u32) -> Self {
        Self {
            start: CellAddr::new(0, col),
            end: CellAddr::new(len.saturating_sub(1), col),
        }
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.end.row - self.start.row + 1
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.end.col - self.start.col + 1
    }

    /// Cells in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = CellAddr> + use<> {
        let Self { start, end } = *self;
        (start.row..=end.row)
            .flat_map(move |row| (start.col..=end.col).map(move |col| CellAddr::new(row, col)))
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

/// Current dimensions of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetBounds {
    pub rows: u32,
    pub cols: u32,
}

impl SheetBounds {
    #[must_use]
    pub const fn new(rows: u32, cols: u32) -> Self {
        Self { rows, cols }
    }

    #[must_use]
    pub const fn contains_cell(&self, cell: CellAddr) -> bool {
        cell.row < self.rows && cell.col < self.cols
    }

    #[must_use]
    pub const fn contains(&self, target: &SpreadsheetRef) -> bool {
        match target {
            SpreadsheetRef::Cell(cell) => self.contains_cell(*cell),
            SpreadsheetRef::Row(row) => *row < self.rows,
            SpreadsheetRef::Column(col) => *col < self.cols,
            SpreadsheetRef::Range(range) => self.contains_cell(range.end),
        }
    }

    /// Check that `target` resolves inside these bounds.
    ///
    /// # Errors
    /// Returns [`AddressError::OutOfBounds`] otherwise.
    pub fn check(&self, target: &SpreadsheetRef) -> Result<(), AddressError> {
        if self.contains(target) {
            Ok(())
        } else {
            Err(AddressError::OutOfBounds {
                address: target.to_string(),
                rows: self.rows,
                cols: self.cols,
            })
        }
    }

    /// Same as [`check`](Self::check) for a bare range.
    ///
    /// # Errors
    /// Returns [`AddressError::OutOfBounds`] if the range leaves the sheet.
    pub fn check_range(&self, range: CellRange) -> Result<(), AddressError> {
        self.check(&SpreadsheetRef::Range(range))
    }
}

impl Default for SheetBounds {
    fn default() -> Self {
        Self::new(1000, 26)
    }
}

/// An address into the spreadsheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpreadsheetRef {
    Cell(CellAddr),
    /// 0-based row index.
    Row(u32),
    /// 0-based column index.
    Column(u32),
    Range(CellRange),
}

impl SpreadsheetRef {
    /// Parse any address form: `A1`, `7`, `C`, `A1:C10`.
    ///
    /// # Errors
    /// Returns an [`AddressError`] if the text is not a valid address.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let text: String = input.trim().chars().filter(|c| *c != '$').collect();
        if text.is_empty() {
            return Err(AddressError::Empty);
        }

        if let Some((start, end)) = text.split_once(':') {
            let start = parse_cell(start, input)?;
            let end = parse_cell(end, input)?;
            return CellRange::new(start, end).map(Self::Range);
        }

        if text.bytes().all(|b| b.is_ascii_digit()) {
            return parse_row(&text, input).map(Self::Row);
        }

        if text.bytes().all(|b| b.is_ascii_alphabetic()) {
            return parse_column(&text, input).map(Self::Column);
        }

        parse_cell(&text, input).map(Self::Cell)
    }

    /// Parse and require a specific address kind.
    ///
    /// A single cell is accepted where a range is expected (`A1` == `A1:A1`).
    ///
    /// # Errors
    /// Returns [`AddressError::WrongKind`] when the address parses to another kind.
    pub fn parse_as(kind: RefKind, input: &str) -> Result<Self, AddressError> {
        let parsed = Self::parse(input)?;
        match (kind, parsed) {
            (RefKind::Range, Self::Cell(cell)) => Ok(Self::Range(CellRange {
                start: cell,
                end: cell,
            })),
            _ if parsed.kind() == kind => Ok(parsed),
            _ => Err(AddressError::WrongKind {
                expected: kind,
                found: input.trim().to_string(),
            }),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> RefKind {
        match self {
            Self::Cell(_) => RefKind::Cell,
            Self::Row(_) => RefKind::Row,
            Self::Column(_) => RefKind::Column,
            Self::Range(_) => RefKind::Range,
        }
    }

    /// Number of cells covered, given the sheet's bounds for whole rows/columns.
    #[must_use]
    pub fn cell_count(&self, bounds: SheetBounds) -> u64 {
        match self {
            Self::Cell(_) => 1,
            Self::Row(_) => u64::from(bounds.cols),
            Self::Column(_) => u64::from(bounds.rows),
            Self::Range(range) => u64::from(range.height()) * u64::from(range.width()),
        }
    }
}

impl fmt::Display for SpreadsheetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cell(cell) => write!(f, "{cell}"),
            Self::Row(row) => write!(f, "{}", row + 1),
            Self::Column(col) => f.write_str(&col_to_letters(*col)),
            Self::Range(range) => write!(f, "{range}"),
        }
    }
}

impl std::str::FromStr for SpreadsheetRef {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Convert a 0-based column index to letters: 0=A, 25=Z, 26=AA.
#[must_use]
pub fn col_to_letters(col: u32) -> String {
    let mut result = String::new();
    let mut n = col;
    loop {
        let digit = u8::try_from(n % 26).unwrap_or_default();
        result.insert(0, char::from(b'A' + digit));
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    result
}

/// Convert column letters to a 0-based index.
///
/// # Errors
/// Returns an [`AddressError`] for non-letters or columns past [`MAX_COLS`].
pub fn letters_to_col(letters: &str) -> Result<u32, AddressError> {
    parse_column(letters, letters)
}

fn parse_column(letters: &str, original: &str) -> Result<u32, AddressError> {
    if letters.is_empty() || letters.len() > 3 || !letters.bytes().all(|b| b.is_ascii_alphabetic())
    {
        return Err(AddressError::Malformed(original.to_string()));
    }
    let number = letters
        .bytes()
        .fold(0u32, |acc, b| acc * 26 + u32::from(b.to_ascii_uppercase() - b'A' + 1));
    if number > MAX_COLS {
        return Err(AddressError::BeyondLimits(original.to_string()));
    }
    Ok(number - 1)
}

fn parse_row(digits: &str, original: &str) -> Result<u32, AddressError> {
    if digits.is_empty() || digits.len() > 7 {
        return Err(AddressError::Malformed(original.to_string()));
    }
    let number: u32 = digits
        .parse()
        .map_err(|_| AddressError::Malformed(original.to_string()))?;
    if number == 0 {
        return Err(AddressError::Malformed(original.to_string()));
    }
    if number > MAX_ROWS {
        return Err(AddressError::BeyondLimits(original.to_string()));
    }
    Ok(number - 1)
}

fn parse_cell(text: &str, original: &str) -> Result<CellAddr, AddressError> {
    let text = text.trim().trim_start_matches('$');
    let split = text
        .find(|c: char| !c.is_ascii_alphabetic())
        .ok_or_else(|| AddressError::Malformed(original.to_string()))?;
    let (letters, digits) = text.split_at(split);
    let digits = digits.trim_start_matches('$');
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AddressError::Malformed(original.to_string()));
    }
    let col = parse_column(letters, original)?;
    let row = parse_row(digits, original)?;
    Ok(CellAddr::new(row, col))
}
