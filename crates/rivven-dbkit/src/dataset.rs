//! Column-oriented in-memory result table

use serde::{Deserialize, Serialize};

use crate::connection::RowStream;
use crate::error::{Error, Result};
use crate::stream::VecRowStream;
use crate::types::{Row, Value};

/// Query result held column by column
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSet {
    columns: Vec<String>,
    data: Vec<Vec<Value>>,
    row_count: usize,
}

impl DataSet {
    /// Empty data set with the given columns
    pub fn new(columns: Vec<String>) -> Self {
        let data = vec![Vec::new(); columns.len()];
        Self {
            columns,
            data,
            row_count: 0,
        }
    }

    /// Read a window of the stream: skip `offset` rows, keep at most `count`
    pub async fn collect(
        rows: &mut dyn RowStream,
        offset: u64,
        count: Option<u64>,
    ) -> Result<Self> {
        let mut set = Self::default();
        let mut read = 0u64;
        while count.map_or(true, |c| (set.row_count as u64) < c) {
            let Some(row) = rows.next().await? else {
                break;
            };
            read += 1;
            if read <= offset {
                continue;
            }
            set.push_row(row)?;
        }
        Ok(set)
    }

    /// Append a row. The first row of an untyped set fixes the columns.
    pub fn push_row(&mut self, row: Row) -> Result<()> {
        if self.columns.is_empty() && self.row_count == 0 {
            self.columns = row.columns().to_vec();
            self.data = vec![Vec::with_capacity(16); self.columns.len()];
        }
        if row.len() != self.columns.len() {
            return Err(Error::type_conversion(format!(
                "row has {} columns, data set has {}",
                row.len(),
                self.columns.len()
            )));
        }
        for (column, value) in self.data.iter_mut().zip(row.into_values()) {
            column.push(value);
        }
        self.row_count += 1;
        Ok(())
    }

    /// Column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of rows
    #[inline]
    pub fn len(&self) -> usize {
        self.row_count
    }

    /// Whether there are no rows
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    /// Column values by name (case-insensitive)
    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .map(|i| self.data[i].as_slice())
    }

    /// Column values by index
    pub fn column_at(&self, index: usize) -> Option<&[Value]> {
        self.data.get(index).map(Vec::as_slice)
    }

    /// Single cell
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        self.column(column).and_then(|values| values.get(row))
    }

    /// Row `index`, reassembled
    pub fn row(&self, index: usize) -> Option<Row> {
        if index >= self.row_count {
            return None;
        }
        let values = self.data.iter().map(|c| c[index].clone()).collect();
        Some(Row::new(self.columns.clone(), values))
    }

    /// Rows in order
    pub fn rows(&self) -> impl Iterator<Item = Row> + '_ {
        (0..self.row_count).filter_map(move |i| self.row(i))
    }

    /// Replay the rows as a cursor
    pub fn into_row_stream(self) -> VecRowStream {
        let rows = self.rows().collect();
        VecRowStream::new(rows)
    }
}
