//! SQL Server executor backed by `tiberius` over a per-call TCP stream.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use tiberius::{Client, ColumnType, Config, Row};
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncWriteCompatExt;
use tracing::{debug, warn};

use crate::envelope::MSSQL_PLUGIN;

use super::{rows_to_maps, CellValue, ConnectionBody, ExecuteOptions, QueryResult, SqlExecutor};

pub struct MssqlExecutor;

impl MssqlExecutor {
    /// ADO-style connection string. Encryption stays off and the server
    /// certificate is trusted, matching the local-network posture of the
    /// other dialects.
    fn ado_string(body: &ConnectionBody) -> String {
        format!(
            "server=tcp:{},{};user id={};password={};database={};encrypt=false;TrustServerCertificate=true",
            body.host,
            body.port.get(),
            body.user,
            body.password,
            body.database,
        )
    }

    async fn run(
        body: &ConnectionBody,
        opts: &ExecuteOptions,
    ) -> Result<QueryResult, tiberius::error::Error> {
        let config = Config::from_ado_string(&Self::ado_string(body))?;
        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true)?;
        let mut client = Client::connect(config, tcp.compat_write()).await?;

        debug!(sql = %body.sql, "executing mssql query");
        let stream = client.query(&body.sql, &[]).await?;
        let rows: Vec<Row> = stream.into_first_result().await?;
        // client drops here, closing the TCP stream with it

        let Some(first) = rows.first() else {
            return Ok(QueryResult::success(Vec::new(), Vec::new()));
        };
        let columns: Vec<(String, ColumnType)> = first
            .columns()
            .iter()
            .map(|c| (c.name().to_string(), c.column_type()))
            .collect();
        let names: Vec<String> = columns.iter().map(|(name, _)| name.clone()).collect();

        let mut cells = Vec::with_capacity(rows.len());
        for row in &rows {
            let decoded = columns
                .iter()
                .enumerate()
                .map(|(i, (_, ty))| extract_value(row, i, scan_kind(*ty)))
                .collect();
            cells.push(decoded);
        }
        let maps = rows_to_maps(&names, cells, opts.value_as_bytes);
        Ok(QueryResult::success(names, maps))
    }
}

#[async_trait]
impl SqlExecutor for MssqlExecutor {
    fn dialect(&self) -> &'static str {
        "mssql"
    }

    fn plugin_name(&self) -> &'static str {
        MSSQL_PLUGIN
    }

    async fn execute(&self, body: &ConnectionBody, opts: &ExecuteOptions) -> QueryResult {
        match Self::run(body, opts).await {
            Ok(result) => result,
            Err(err) => {
                warn!(%err, "mssql query failed");
                QueryResult::failure(err.to_string())
            }
        }
    }
}

/// Scan target selected from the declared column type, mirroring how the
/// other dialects bucket DECIMAL/NUMERIC/FLOAT → float, the INT family →
/// integer, BIT → bool, the date/time family → timestamps and everything
/// else → text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanKind {
    Bool,
    Int,
    Float,
    Decimal,
    Date,
    Time,
    DateTime,
    DateTimeOffset,
    Bytes,
    Guid,
    Text,
}

fn scan_kind(ty: ColumnType) -> ScanKind {
    match ty {
        ColumnType::Bit | ColumnType::Bitn => ScanKind::Bool,
        ColumnType::Int1 | ColumnType::Int2 | ColumnType::Int4 | ColumnType::Int8
        | ColumnType::Intn => ScanKind::Int,
        // money columns come off the wire as 64-bit floats, not TDS numerics
        ColumnType::Float4 | ColumnType::Float8 | ColumnType::Floatn | ColumnType::Money
        | ColumnType::Money4 => ScanKind::Float,
        ColumnType::Decimaln | ColumnType::Numericn => ScanKind::Decimal,
        ColumnType::Daten => ScanKind::Date,
        ColumnType::Timen => ScanKind::Time,
        ColumnType::Datetime | ColumnType::Datetime2 | ColumnType::Datetimen
        | ColumnType::Datetime4 => ScanKind::DateTime,
        ColumnType::DatetimeOffsetn => ScanKind::DateTimeOffset,
        ColumnType::BigBinary | ColumnType::BigVarBin | ColumnType::Image => ScanKind::Bytes,
        ColumnType::Guid => ScanKind::Guid,
        _ => ScanKind::Text,
    }
}

fn extract_value(row: &Row, idx: usize, kind: ScanKind) -> CellValue {
    match kind {
        ScanKind::Bool => row
            .try_get::<bool, _>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bool)
            .unwrap_or(CellValue::Null),
        ScanKind::Int => extract_int(row, idx),
        ScanKind::Float => {
            if let Ok(Some(v)) = row.try_get::<f64, _>(idx) {
                CellValue::Float(v)
            } else if let Ok(Some(v)) = row.try_get::<f32, _>(idx) {
                CellValue::Float(f64::from(v))
            } else {
                CellValue::Null
            }
        }
        ScanKind::Decimal => row
            .try_get::<tiberius::numeric::Numeric, _>(idx)
            .ok()
            .flatten()
            .map(|n| CellValue::Float(f64::from(n)))
            .unwrap_or(CellValue::Null),
        ScanKind::Date => row
            .try_get::<NaiveDate, _>(idx)
            .ok()
            .flatten()
            .map(CellValue::Date)
            .unwrap_or(CellValue::Null),
        ScanKind::Time => row
            .try_get::<NaiveTime, _>(idx)
            .ok()
            .flatten()
            .map(CellValue::Time)
            .unwrap_or(CellValue::Null),
        ScanKind::DateTime => row
            .try_get::<NaiveDateTime, _>(idx)
            .ok()
            .flatten()
            .map(CellValue::DateTime)
            .unwrap_or(CellValue::Null),
        ScanKind::DateTimeOffset => row
            .try_get::<DateTime<Utc>, _>(idx)
            .ok()
            .flatten()
            .map(CellValue::TimestampTz)
            .unwrap_or(CellValue::Null),
        ScanKind::Bytes => row
            .try_get::<&[u8], _>(idx)
            .ok()
            .flatten()
            .map(|b| CellValue::Bytes(b.to_vec()))
            .unwrap_or(CellValue::Null),
        ScanKind::Guid => row
            .try_get::<tiberius::Uuid, _>(idx)
            .ok()
            .flatten()
            .map(|g| CellValue::Text(g.to_string()))
            .unwrap_or(CellValue::Null),
        ScanKind::Text => row
            .try_get::<&str, _>(idx)
            .ok()
            .flatten()
            .map(|s| CellValue::Text(s.to_string()))
            .unwrap_or(CellValue::Null),
    }
}

/// TDS reports a width-specific integer type per column; try the widths from
/// largest down so every INT family member lands in an i64.
fn extract_int(row: &Row, idx: usize) -> CellValue {
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return v.map(CellValue::Int).unwrap_or(CellValue::Null);
    }
    if let Ok(v) = row.try_get::<i32, _>(idx) {
        return v.map(|v| CellValue::Int(i64::from(v))).unwrap_or(CellValue::Null);
    }
    if let Ok(v) = row.try_get::<i16, _>(idx) {
        return v.map(|v| CellValue::Int(i64::from(v))).unwrap_or(CellValue::Null);
    }
    if let Ok(v) = row.try_get::<u8, _>(idx) {
        return v.map(|v| CellValue::Int(i64::from(v))).unwrap_or(CellValue::Null);
    }
    CellValue::Null
}
