//! PostgreSQL executor backed by `tokio-postgres`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio_postgres::types::Type;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, warn};

use crate::envelope::PGSQL_PLUGIN;

use super::{rows_to_maps, CellValue, ConnectionBody, ExecuteOptions, QueryResult, SqlExecutor};

pub struct PgExecutor;

impl PgExecutor {
    /// libpq-style `key=value` connection string. TLS is not negotiated; the
    /// agent talks to databases on the local network segment.
    fn connection_string(body: &ConnectionBody) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} sslmode=disable connect_timeout=10",
            quote_conn_value(&body.host),
            body.port.get(),
            quote_conn_value(&body.user),
            quote_conn_value(&body.password),
            quote_conn_value(&body.database),
        )
    }

    async fn run(
        body: &ConnectionBody,
        opts: &ExecuteOptions,
    ) -> Result<QueryResult, tokio_postgres::Error> {
        let (client, connection) =
            tokio_postgres::connect(&Self::connection_string(body), NoTls).await?;
        // The connection task ends when the client is dropped at the end of
        // this call; no pooling across calls.
        let driver = tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(%err, "postgres connection error");
            }
        });

        debug!(sql = %body.sql, "executing postgres query");
        let rows = client.query(&body.sql, &[]).await?;
        let result = parse_rows(&rows, opts);
        drop(client);
        driver.abort();
        Ok(result)
    }
}

#[async_trait]
impl SqlExecutor for PgExecutor {
    fn dialect(&self) -> &'static str {
        "pgsql"
    }

    fn plugin_name(&self) -> &'static str {
        PGSQL_PLUGIN
    }

    async fn execute(&self, body: &ConnectionBody, opts: &ExecuteOptions) -> QueryResult {
        match Self::run(body, opts).await {
            Ok(result) => result,
            Err(err) => {
                warn!(%err, "postgres query failed");
                QueryResult::failure(err.to_string())
            }
        }
    }
}

fn parse_rows(rows: &[Row], opts: &ExecuteOptions) -> QueryResult {
    let Some(first) = rows.first() else {
        return QueryResult::success(Vec::new(), Vec::new());
    };

    let columns: Vec<String> = first
        .columns()
        .iter()
        .map(|col| col.name().to_string())
        .collect();

    let mut cells = Vec::with_capacity(rows.len());
    for row in rows {
        let decoded = row
            .columns()
            .iter()
            .enumerate()
            .map(|(i, col)| extract_value(row, i, col.type_()))
            .collect();
        cells.push(decoded);
    }

    let maps = rows_to_maps(&columns, cells, opts.value_as_bytes);
    QueryResult::success(columns, maps)
}

fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> CellValue {
    match *pg_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bool)
            .unwrap_or(CellValue::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(|v| CellValue::Int(i64::from(v)))
            .unwrap_or(CellValue::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(|v| CellValue::Int(i64::from(v)))
            .unwrap_or(CellValue::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int)
            .unwrap_or(CellValue::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(|v| CellValue::Float(f64::from(v)))
            .unwrap_or(CellValue::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Float)
            .unwrap_or(CellValue::Null),
        Type::NUMERIC => row
            .try_get::<_, Option<Decimal>>(idx)
            .ok()
            .flatten()
            .map(numeric_cell)
            .unwrap_or(CellValue::Null),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bytes)
            .unwrap_or(CellValue::Null),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Date)
            .unwrap_or(CellValue::Null),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Time)
            .unwrap_or(CellValue::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(CellValue::DateTime)
            .unwrap_or(CellValue::Null),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map(CellValue::TimestampTz)
            .unwrap_or(CellValue::Null),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Json)
            .unwrap_or(CellValue::Null),
        // all string/char/text types, plus anything unrecognized
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Text)
            .unwrap_or(CellValue::Null),
    }
}

/// Numeric values become 64-bit floats; if the conversion fails the exact
/// decimal text is kept instead.
fn numeric_cell(value: Decimal) -> CellValue {
    match value.to_f64() {
        Some(f) if f.is_finite() => CellValue::Float(f),
        _ => CellValue::Text(value.to_string()),
    }
}

/// Quote a value for use in a libpq key=value connection string.
/// Wraps in single quotes and escapes backslashes and single quotes.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}
