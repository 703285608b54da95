//! In-memory spreadsheet storage.

use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;
use sheet_agents_core::{
    CellAddr, CellRange, CellValue, SheetBounds,
    traits::{SpreadsheetStore, StoreError},
};

use super::functions;

type Cells = HashMap<CellAddr, CellValue>;

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart. The sheet has fixed bounds and never grows;
/// concurrent writers of one cell resolve last-write-wins.
pub struct MemoryStore {
    bounds: SheetBounds,
    cells: RwLock<Cells>,
}

impl MemoryStore {
    /// Create an empty sheet with the given bounds.
    #[must_use]
    pub fn new(bounds: SheetBounds) -> Self {
        Self {
            bounds,
            cells: RwLock::new(HashMap::new()),
        }
    }

    /// Number of non-empty cells.
    ///
    /// # Errors
    /// Returns error if the cell map lock is poisoned.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.len())
    }

    /// Whether every cell is empty.
    ///
    /// # Errors
    /// Returns error if the cell map lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.read()?.is_empty())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Cells>, StoreError> {
        self.cells
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Cells>, StoreError> {
        self.cells
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))
    }

    fn check(&self, range: CellRange) -> Result<(), StoreError> {
        self.bounds
            .check_range(range)
            .map_err(|e| StoreError::OutOfBounds(e.to_string()))
    }

    fn read_range(&self, range: CellRange) -> Result<Vec<Vec<CellValue>>, StoreError> {
        self.check(range)?;
        let cells = self.read()?;
        Ok((range.start.row..=range.end.row)
            .map(|row| {
                (range.start.col..=range.end.col)
                    .map(|col| get(&cells, CellAddr::new(row, col)))
                    .collect()
            })
            .collect())
    }

    fn write_cells(
        &self,
        range: CellRange,
        values: impl IntoIterator<Item = CellValue>,
    ) -> Result<(), StoreError> {
        self.check(range)?;
        let mut cells = self.write()?;
        for (addr, value) in range.cells().zip(values) {
            put(&mut cells, addr, value);
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(SheetBounds::default())
    }
}

fn get(cells: &Cells, addr: CellAddr) -> CellValue {
    cells.get(&addr).cloned().unwrap_or_default()
}

fn put(cells: &mut Cells, addr: CellAddr, value: CellValue) {
    if value.is_empty() {
        cells.remove(&addr);
    } else {
        cells.insert(addr, value);
    }
}

fn single_row(values: Vec<Vec<CellValue>>) -> Vec<CellValue> {
    values.into_iter().next().unwrap_or_default()
}

fn single_column(values: Vec<Vec<CellValue>>) -> Vec<CellValue> {
    values
        .into_iter()
        .map(|row| row.into_iter().next().unwrap_or_default())
        .collect()
}

fn len_u32(len: usize) -> Result<u32, StoreError> {
    u32::try_from(len).map_err(|_| StoreError::OutOfBounds(format!("{len} values")))
}

#[async_trait]
impl SpreadsheetStore for MemoryStore {
    async fn bounds(&self) -> Result<SheetBounds, StoreError> {
        Ok(self.bounds)
    }

    async fn get_cell(&self, cell: CellAddr) -> Result<CellValue, StoreError> {
        self.check(CellRange {
            start: cell,
            end: cell,
        })?;
        Ok(get(&*self.read()?, cell))
    }

    async fn get_row(&self, row: u32) -> Result<Vec<CellValue>, StoreError> {
        self.read_range(CellRange::row_prefix(row, self.bounds.cols))
            .map(single_row)
    }

    async fn get_column(&self, col: u32) -> Result<Vec<CellValue>, StoreError> {
        self.read_range(CellRange::column_prefix(col, self.bounds.rows))
            .map(single_column)
    }

    async fn get_range(&self, range: CellRange) -> Result<Vec<Vec<CellValue>>, StoreError> {
        self.read_range(range)
    }

    async fn set_cell(&self, cell: CellAddr, value: CellValue) -> Result<(), StoreError> {
        self.write_cells(
            CellRange {
                start: cell,
                end: cell,
            },
            [value],
        )
    }

    async fn set_row(&self, row: u32, values: Vec<CellValue>) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let range = CellRange::row_prefix(row, len_u32(values.len())?);
        self.write_cells(range, values)
    }

    async fn set_column(&self, col: u32, values: Vec<CellValue>) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let range = CellRange::column_prefix(col, len_u32(values.len())?);
        self.write_cells(range, values)
    }

    async fn set_range(
        &self,
        range: CellRange,
        values: Vec<Vec<CellValue>>,
    ) -> Result<(), StoreError> {
        let expected = u64::from(range.height()) * u64::from(range.width());
        let width = range.width() as usize;
        let found: u64 = values.iter().map(|row| row.len() as u64).sum();
        if values.len() != range.height() as usize || values.iter().any(|row| row.len() != width)
        {
            return Err(StoreError::ShapeMismatch { expected, found });
        }
        self.write_cells(range, values.into_iter().flatten())
    }

    async fn execute_function(&self, query: &str) -> Result<CellValue, StoreError> {
        let cells = self.read()?;
        functions::evaluate(query, self.bounds, |addr| get(&cells, addr))
    }
}
