use crate::error::{EngineError, EngineResult};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Input rows keyed by entity id. The first CSV column is the id; the
/// remaining columns are passed positionally to the executor.
#[derive(Debug, Clone, Default)]
pub struct InputTable {
    order: Vec<u64>,
    rows: BTreeMap<u64, Vec<f64>>,
}

impl InputTable {
    pub fn from_rows(rows: impl IntoIterator<Item = (u64, Vec<f64>)>) -> Self {
        let mut table = InputTable::default();
        for (id, values) in rows {
            if table.rows.insert(id, values).is_none() {
                table.order.push(id);
            }
        }
        table
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| EngineError::Table {
            path: path.to_path_buf(),
            line: 0,
            message: format!("cannot read table: {}", e),
        })?;
        Self::parse(path, &raw)
    }

    fn parse(path: &Path, raw: &str) -> EngineResult<Self> {
        let err = |line: usize, message: String| EngineError::Table {
            path: path.to_path_buf(),
            line,
            message,
        };
        let mut table = InputTable::default();
        // line 1 is the header
        for (idx, line) in raw.lines().enumerate().skip(1) {
            let line_no = idx + 1;
            if line.trim().is_empty() {
                continue;
            }
            let mut cells = line.split(',').map(str::trim);
            let id_cell = cells.next().unwrap_or_default();
            let id = id_cell
                .parse::<u64>()
                .map_err(|_| err(line_no, format!("invalid id '{}'", id_cell)))?;
            let values = cells
                .map(|cell| {
                    cell.parse::<f64>()
                        .map_err(|_| err(line_no, format!("invalid number '{}'", cell)))
                })
                .collect::<EngineResult<Vec<f64>>>()?;
            if table.rows.contains_key(&id) {
                return Err(err(line_no, format!("duplicate id {}", id)));
            }
            table.rows.insert(id, values);
            table.order.push(id);
        }
        Ok(table)
    }

    pub fn get(&self, id: u64) -> Option<&[f64]> {
        self.rows.get(&id).map(Vec::as_slice)
    }

    /// Ids in table order.
    pub fn ids(&self) -> &[u64] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Scenario assumptions and policy data shared read-only by all workers.
#[derive(Debug, Clone, Default)]
pub struct JobInputs {
    pub scenarios: InputTable,
    pub policies: InputTable,
}
