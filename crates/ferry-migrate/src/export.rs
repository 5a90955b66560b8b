//! Exporter: query result to staging file

use std::path::{Path, PathBuf};

use ferry_rdbc::connection::Connection;
use tracing::{debug, info};

use crate::error::ExportError;
use crate::staging::{render_value, write_staging};

/// Outcome of a successful export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    /// Data rows written (excluding the header)
    pub rows: u64,
    /// Header as written, index column first
    pub columns: Vec<String>,
    /// Staging file location
    pub path: PathBuf,
}

/// Run `query` and write its full result to `path` as CSV.
///
/// The column matching `index_column` (case-insensitive) is moved to the
/// front; the others keep query order. The header is written even when
/// the query returns no rows. Nothing is written if the query fails or
/// the index column is missing.
pub async fn export_to_csv(
    conn: &dyn Connection,
    query: &str,
    index_column: &str,
    path: &Path,
) -> Result<ExportSummary, ExportError> {
    debug!(index_column, path = %path.display(), "Running export query");

    let result = conn.query_set(query, &[]).await.map_err(ExportError::Query)?;

    let index = result
        .column_index(index_column)
        .ok_or_else(|| ExportError::IndexColumnNotFound {
            column: index_column.to_string(),
            available: result.columns.join(", "),
        })?;

    let order: Vec<usize> = std::iter::once(index)
        .chain((0..result.columns.len()).filter(|&i| i != index))
        .collect();
    let header: Vec<String> = order.iter().map(|&i| result.columns[i].clone()).collect();

    debug!(rows = result.len(), columns = header.len(), "Query returned");

    let records = result.rows.iter().map(|row| {
        order
            .iter()
            .map(|&i| row.get(i).map(render_value).unwrap_or_default())
            .collect::<Vec<String>>()
    });

    let rows = write_staging(path, &header, records).map_err(|source| ExportError::Write {
        path: path.to_path_buf(),
        source,
    })?;

    info!(rows, path = %path.display(), "Exported query result to CSV");

    Ok(ExportSummary {
        rows,
        columns: header,
        path: path.to_path_buf(),
    })
}
