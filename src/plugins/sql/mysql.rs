//! MySQL executor backed by `mysql_async`.
//!
//! The text protocol delivers every non-NULL value as raw bytes, so row
//! normalization keys off the declared column type.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use mysql_async::consts::ColumnType;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder, Row, Value};
use tracing::{debug, warn};

use crate::envelope::MYSQL_PLUGIN;

use super::{rows_to_maps, CellValue, ConnectionBody, ExecuteOptions, QueryResult, SqlExecutor};

pub struct MySqlExecutor;

impl MySqlExecutor {
    /// `user:pass@tcp(host:port)/db` semantics via the typed options builder.
    fn opts(body: &ConnectionBody) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(body.host.clone())
            .tcp_port(body.port.get())
            .user(Some(body.user.clone()))
            .pass(Some(body.password.clone()))
            .db_name(Some(body.database.clone()))
            .into()
    }

    async fn run(body: &ConnectionBody, opts: &ExecuteOptions) -> mysql_async::Result<QueryResult> {
        let mut conn = Conn::new(Self::opts(body)).await?;
        debug!(sql = %body.sql, "executing mysql query");

        let query = conn.query_iter(&body.sql).await?;
        let columns: Vec<(String, ColumnType)> = query
            .columns()
            .map(|cols| {
                cols.iter()
                    .map(|c| (c.name_str().into_owned(), c.column_type()))
                    .collect()
            })
            .unwrap_or_default();
        let rows: Vec<Row> = query.collect_and_drop().await?;
        conn.disconnect().await?;

        let names: Vec<String> = columns.iter().map(|(name, _)| name.clone()).collect();
        let mut cells = Vec::with_capacity(rows.len());
        for row in &rows {
            let decoded = columns
                .iter()
                .enumerate()
                .map(|(i, (_, ty))| match row.as_ref(i) {
                    Some(value) => decode_value(*ty, value),
                    None => CellValue::Null,
                })
                .collect();
            cells.push(decoded);
        }
        let maps = rows_to_maps(&names, cells, opts.value_as_bytes);
        Ok(QueryResult::success(names, maps))
    }
}

#[async_trait]
impl SqlExecutor for MySqlExecutor {
    fn dialect(&self) -> &'static str {
        "mysql"
    }

    fn plugin_name(&self) -> &'static str {
        MYSQL_PLUGIN
    }

    async fn execute(&self, body: &ConnectionBody, opts: &ExecuteOptions) -> QueryResult {
        match Self::run(body, opts).await {
            Ok(result) => result,
            Err(err) => {
                warn!(%err, "mysql query failed");
                QueryResult::failure(err.to_string())
            }
        }
    }
}

/// Map one wire value to a normalized cell using the declared column type.
fn decode_value(ty: ColumnType, value: &Value) -> CellValue {
    match value {
        Value::NULL => CellValue::Null,
        Value::Int(i) => CellValue::Int(*i),
        Value::UInt(u) => i64::try_from(*u)
            .map(CellValue::Int)
            .unwrap_or_else(|_| CellValue::Text(u.to_string())),
        Value::Float(f) => CellValue::Float(f64::from(*f)),
        Value::Double(d) => CellValue::Float(*d),
        Value::Date(y, mo, d, h, mi, s, us) => {
            match NaiveDate::from_ymd_opt(i32::from(*y), u32::from(*mo), u32::from(*d))
                .and_then(|date| date.and_hms_micro_opt(u32::from(*h), u32::from(*mi), u32::from(*s), *us))
            {
                Some(dt) => CellValue::DateTime(dt),
                None => CellValue::Null,
            }
        }
        Value::Time(neg, days, h, m, s, us) => {
            let sign = if *neg { "-" } else { "" };
            let hours = u32::from(*days) * 24 + u32::from(*h);
            CellValue::Text(format!("{sign}{hours:02}:{m:02}:{s:02}.{us:06}"))
        }
        Value::Bytes(bytes) => decode_bytes(ty, bytes),
    }
}

fn decode_bytes(ty: ColumnType, bytes: &[u8]) -> CellValue {
    let text = || String::from_utf8_lossy(bytes).into_owned();
    match ty {
        ColumnType::MYSQL_TYPE_DECIMAL
        | ColumnType::MYSQL_TYPE_NEWDECIMAL
        | ColumnType::MYSQL_TYPE_FLOAT
        | ColumnType::MYSQL_TYPE_DOUBLE => text()
            .parse::<f64>()
            .map(CellValue::Float)
            .unwrap_or_else(|_| CellValue::Text(text())),
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_YEAR => text()
            .parse::<i64>()
            .map(CellValue::Int)
            .unwrap_or_else(|_| CellValue::Text(text())),
        ColumnType::MYSQL_TYPE_BIT => CellValue::Bool(bytes.iter().any(|b| *b != 0)),
        ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => {
            NaiveDate::parse_from_str(&text(), "%Y-%m-%d")
                .map(CellValue::Date)
                .unwrap_or_else(|_| CellValue::Text(text()))
        }
        ColumnType::MYSQL_TYPE_DATETIME
        | ColumnType::MYSQL_TYPE_DATETIME2
        | ColumnType::MYSQL_TYPE_TIMESTAMP
        | ColumnType::MYSQL_TYPE_TIMESTAMP2 => {
            NaiveDateTime::parse_from_str(&text(), "%Y-%m-%d %H:%M:%S%.f")
                .map(CellValue::DateTime)
                .unwrap_or_else(|_| CellValue::Text(text()))
        }
        ColumnType::MYSQL_TYPE_JSON => serde_json::from_slice(bytes)
            .map(CellValue::Json)
            .unwrap_or_else(|_| CellValue::Text(text())),
        ColumnType::MYSQL_TYPE_TINY_BLOB
        | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
        | ColumnType::MYSQL_TYPE_LONG_BLOB
        | ColumnType::MYSQL_TYPE_BLOB
        | ColumnType::MYSQL_TYPE_GEOMETRY => CellValue::Bytes(bytes.to_vec()),
        _ => CellValue::Text(text()),
    }
}
