//! Oracle executor. The `oracle` crate is synchronous, so each call runs on
//! the blocking pool via `spawn_blocking`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use oracle::sql_type::OracleType;
use oracle::Connection;
use tracing::{debug, warn};

use crate::envelope::ORACLEDB_PLUGIN;

use super::{rows_to_maps, CellValue, ConnectionBody, ExecuteOptions, QueryResult, SqlExecutor};

pub struct OracleExecutor;

impl OracleExecutor {
    /// Connect string selection: an explicit SID gets a full TNS descriptor,
    /// otherwise the service name goes through Easy Connect syntax.
    fn connect_string(body: &ConnectionBody) -> String {
        if !body.sid.is_empty() {
            format!(
                "(DESCRIPTION=(ADDRESS=(PROTOCOL=TCP)(HOST={})(PORT={}))(CONNECT_DATA=(SID={})))",
                body.host,
                body.port.get(),
                body.sid,
            )
        } else {
            format!("//{}:{}/{}", body.host, body.port.get(), body.service_name)
        }
    }

    fn run_blocking(body: &ConnectionBody, opts: &ExecuteOptions) -> oracle::Result<QueryResult> {
        let conn = Connection::connect(&body.user, &body.password, Self::connect_string(body))?;

        debug!(sql = %body.sql, "executing oracle query");
        let rows = conn.query(&body.sql, &[])?;

        let columns: Vec<(String, OracleType)> = rows
            .column_info()
            .iter()
            .map(|ci| (ci.name().to_string(), ci.oracle_type().clone()))
            .collect();
        let names: Vec<String> = columns.iter().map(|(name, _)| name.clone()).collect();

        let mut cells = Vec::new();
        for row in rows {
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    warn!(%err, "skipping undecodable oracle row");
                    continue;
                }
            };
            let decoded = columns
                .iter()
                .enumerate()
                .map(|(i, (_, ty))| extract_value(&row, i, ty))
                .collect();
            cells.push(decoded);
        }
        conn.close()?;

        let maps = rows_to_maps(&names, cells, opts.value_as_bytes);
        Ok(QueryResult::success(names, maps))
    }
}

#[async_trait]
impl SqlExecutor for OracleExecutor {
    fn dialect(&self) -> &'static str {
        "oracledb"
    }

    fn plugin_name(&self) -> &'static str {
        ORACLEDB_PLUGIN
    }

    async fn execute(&self, body: &ConnectionBody, opts: &ExecuteOptions) -> QueryResult {
        let body = body.clone();
        let opts = *opts;
        let joined =
            tokio::task::spawn_blocking(move || Self::run_blocking(&body, &opts)).await;
        match joined {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(%err, "oracle query failed");
                QueryResult::failure(err.to_string())
            }
            Err(err) => {
                warn!(%err, "oracle worker task failed");
                QueryResult::failure(err.to_string())
            }
        }
    }
}

fn extract_value(row: &oracle::Row, idx: usize, ty: &OracleType) -> CellValue {
    match ty {
        OracleType::Boolean => row
            .get::<usize, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bool)
            .unwrap_or(CellValue::Null),
        // NUMBER with a zero scale and declared precision holds integers;
        // everything else in the number family scans as a float.
        OracleType::Number(prec, 0) if *prec > 0 => row
            .get::<usize, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int)
            .unwrap_or(CellValue::Null),
        OracleType::Number(_, _)
        | OracleType::Float(_)
        | OracleType::BinaryFloat
        | OracleType::BinaryDouble => row
            .get::<usize, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Float)
            .unwrap_or(CellValue::Null),
        OracleType::Date => row
            .get::<usize, Option<NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Date)
            .unwrap_or(CellValue::Null),
        OracleType::Timestamp(_) => row
            .get::<usize, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(CellValue::DateTime)
            .unwrap_or(CellValue::Null),
        OracleType::TimestampTZ(_) | OracleType::TimestampLTZ(_) => row
            .get::<usize, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map(CellValue::TimestampTz)
            .unwrap_or(CellValue::Null),
        OracleType::Raw(_) | OracleType::LongRaw | OracleType::BLOB => row
            .get::<usize, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bytes)
            .unwrap_or(CellValue::Null),
        _ => row
            .get::<usize, Option<String>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Text)
            .unwrap_or(CellValue::Null),
    }
}
