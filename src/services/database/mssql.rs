// SQL Server driver over tiberius (TDS 7.3+).
//
// Bind parameters use the T-SQL placeholder form `@P1`, `@P2`, ...

use futures::TryStreamExt;
use serde_json::{json, Value};
use std::borrow::Cow;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::driver::{
    is_plain_identifier, DatabaseDriver, DriverConnection, DriverError, DriverErrorClass,
};
use crate::models::{ColumnInfo, DatabaseProfile, DatabaseType, QueryParam, RowSet};

type MssqlClient = Client<Compat<TcpStream>>;

/// Classify a SQL Server error number.
pub(crate) fn classify_mssql_code(code: i64) -> DriverErrorClass {
    match code {
        // deadlock victim, lock request timeout
        1205 | 1222 => DriverErrorClass::Deadlock,
        // Azure throttling / failover, transport-level failures
        40613 | 40197 | 40501 | 49918 | 49919 | 10053 | 10054 | 233 | 64 => {
            DriverErrorClass::Network
        }
        10060 => DriverErrorClass::ConnectTimeout,
        18456 | 18452 | 4060 => DriverErrorClass::Authentication,
        102 | 105 | 156 | 170 | 207 | 208 | 4104 => DriverErrorClass::Syntax,
        229 | 230 | 262 | 297 | 300 => DriverErrorClass::Permission,
        515 | 547 | 2601 | 2627 => DriverErrorClass::Constraint,
        _ => DriverErrorClass::Other,
    }
}

fn map_error(err: tiberius::error::Error) -> DriverError {
    let message = err.to_string();
    if let tiberius::error::Error::Io { kind, .. } = &err {
        let class = if *kind == std::io::ErrorKind::TimedOut {
            DriverErrorClass::ConnectTimeout
        } else {
            DriverErrorClass::Network
        };
        return DriverError::new(class, message);
    }
    match err.code() {
        Some(code) => {
            let code = i64::from(code);
            DriverError::new(classify_mssql_code(code), message).with_code(code)
        }
        None => DriverError::new(DriverErrorClass::Other, message),
    }
}

struct MssqlParam<'a>(&'a QueryParam);

impl ToSql for MssqlParam<'_> {
    fn to_sql(&self) -> ColumnData<'_> {
        match self.0 {
            QueryParam::Null => ColumnData::String(None),
            QueryParam::Bool(b) => ColumnData::Bit(Some(*b)),
            QueryParam::Int(i) => ColumnData::I64(Some(*i)),
            QueryParam::Float(f) => ColumnData::F64(Some(*f)),
            QueryParam::Text(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
        }
    }
}

fn convert_column_data(data: &ColumnData<'_>) -> Value {
    match data {
        ColumnData::Bit(Some(b)) => json!(b),
        ColumnData::U8(Some(v)) => json!(v),
        ColumnData::I16(Some(v)) => json!(v),
        ColumnData::I32(Some(v)) => json!(v),
        ColumnData::I64(Some(v)) => json!(v),
        ColumnData::F32(Some(v)) => json!(v),
        ColumnData::F64(Some(v)) => json!(v),
        ColumnData::Numeric(Some(n)) => json!(n.value() as f64 / 10f64.powi(n.scale() as i32)),
        ColumnData::String(Some(s)) => json!(s.to_string()),
        ColumnData::Guid(Some(g)) => json!(g.to_string()),
        ColumnData::Binary(Some(b)) => {
            json!(b.iter().map(|byte| format!("{:02x}", byte)).collect::<String>())
        }
        ColumnData::Xml(Some(xml)) => json!(xml.to_string()),
        _ => Value::Null,
    }
}

fn convert_row(row: &tiberius::Row) -> Vec<Value> {
    row.cells()
        .enumerate()
        .map(|(i, (_, data))| match data {
            ColumnData::DateTime(Some(_))
            | ColumnData::SmallDateTime(Some(_))
            | ColumnData::DateTime2(Some(_)) => row
                .try_get::<chrono::NaiveDateTime, _>(i)
                .ok()
                .flatten()
                .map(|dt| json!(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()))
                .unwrap_or(Value::Null),
            ColumnData::DateTimeOffset(Some(_)) => row
                .try_get::<chrono::DateTime<chrono::Utc>, _>(i)
                .ok()
                .flatten()
                .map(|dt| json!(dt.to_rfc3339()))
                .unwrap_or(Value::Null),
            ColumnData::Date(Some(_)) => row
                .try_get::<chrono::NaiveDate, _>(i)
                .ok()
                .flatten()
                .map(|d| json!(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null),
            ColumnData::Time(Some(_)) => row
                .try_get::<chrono::NaiveTime, _>(i)
                .ok()
                .flatten()
                .map(|t| json!(t.format("%H:%M:%S%.f").to_string()))
                .unwrap_or(Value::Null),
            _ => convert_column_data(data),
        })
        .collect()
}

pub struct MssqlDriver;

impl MssqlDriver {
    pub fn new() -> Self {
        Self
    }

    fn build_config(profile: &DatabaseProfile) -> Config {
        let mut config = Config::new();
        config.host(&profile.host);
        config.port(profile.port);
        config.authentication(AuthMethod::sql_server(
            &profile.credentials.username,
            &profile.credentials.password,
        ));
        if let Some(db) = profile.database.as_deref().filter(|db| !db.is_empty()) {
            config.database(db);
        }
        config.application_name("db-query-core");
        config.encryption(if profile.option_flag("encrypt") {
            EncryptionLevel::Required
        } else {
            EncryptionLevel::NotSupported
        });
        if profile.option_flag("trust_server_certificate") || !profile.option_flag("encrypt") {
            config.trust_cert();
        }
        config
    }

    async fn open(config: Config) -> Result<MssqlClient, tiberius::error::Error> {
        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true).ok();
        Client::connect(config, tcp.compat_write()).await
    }
}

impl Default for MssqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DatabaseDriver for MssqlDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Mssql
    }

    async fn connect(
        &self,
        profile: &DatabaseProfile,
    ) -> Result<Box<dyn DriverConnection>, DriverError> {
        let config = Self::build_config(profile);
        let mut client = match Self::open(config).await {
            Ok(client) => client,
            // Azure SQL gateways redirect to the node that owns the database
            Err(tiberius::error::Error::Routing { host, port }) => {
                tracing::debug!("SQL Server redirected connection to {}:{}", host, port);
                let mut config = Self::build_config(profile);
                config.host(&host);
                config.port(port);
                Self::open(config).await.map_err(map_error)?
            }
            Err(e) => return Err(map_error(e)),
        };

        let spid = client
            .simple_query("SELECT @@SPID")
            .await
            .map_err(map_error)?
            .into_row()
            .await
            .map_err(map_error)?
            .and_then(|row| row.try_get::<i16, _>(0).ok().flatten())
            .map(|spid| spid.to_string());

        tracing::debug!(
            "Opened SQL Server session {} to {}",
            spid.as_deref().unwrap_or("?"),
            profile.masked_target()
        );

        Ok(Box::new(MssqlConnection {
            client: Some(client),
            spid,
        }))
    }

    fn cancel_sql(&self, session_id: &str) -> Option<String> {
        if session_id.chars().all(|c| c.is_ascii_digit()) && !session_id.is_empty() {
            Some(format!("KILL {}", session_id))
        } else {
            None
        }
    }

    fn columns_sql(&self, profile: &DatabaseProfile) -> String {
        let filter = profile
            .default_schema
            .as_deref()
            .filter(|s| is_plain_identifier(s))
            .map(|s| format!("AND c.TABLE_SCHEMA = '{}' ", s))
            .unwrap_or_default();
        format!(
            "SELECT c.TABLE_SCHEMA, c.TABLE_NAME, c.COLUMN_NAME, c.DATA_TYPE, \
                    CASE WHEN c.IS_NULLABLE = 'YES' THEN 1 ELSE 0 END, \
                    CASE WHEN k.COLUMN_NAME IS NULL THEN 0 ELSE 1 END \
             FROM INFORMATION_SCHEMA.COLUMNS c \
             JOIN INFORMATION_SCHEMA.TABLES t \
               ON t.TABLE_SCHEMA = c.TABLE_SCHEMA AND t.TABLE_NAME = c.TABLE_NAME \
             LEFT JOIN ( \
                SELECT ku.TABLE_SCHEMA, ku.TABLE_NAME, ku.COLUMN_NAME \
                FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
                JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE ku \
                  ON tc.CONSTRAINT_NAME = ku.CONSTRAINT_NAME AND tc.TABLE_SCHEMA = ku.TABLE_SCHEMA \
                WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY' \
             ) k ON k.TABLE_SCHEMA = c.TABLE_SCHEMA AND k.TABLE_NAME = c.TABLE_NAME AND k.COLUMN_NAME = c.COLUMN_NAME \
             WHERE t.TABLE_TYPE IN ('BASE TABLE', 'VIEW') {}\
             ORDER BY c.TABLE_SCHEMA, c.TABLE_NAME, c.ORDINAL_POSITION",
            filter
        )
    }

    fn foreign_keys_sql(&self, profile: &DatabaseProfile) -> String {
        let filter = profile
            .default_schema
            .as_deref()
            .filter(|s| is_plain_identifier(s))
            .map(|s| format!("WHERE SCHEMA_NAME(fk.schema_id) = '{}'", s))
            .unwrap_or_default();
        format!(
            "SELECT SCHEMA_NAME(fk.schema_id), OBJECT_NAME(fk.parent_object_id), \
                    COL_NAME(fkc.parent_object_id, fkc.parent_column_id), \
                    OBJECT_NAME(fk.referenced_object_id), \
                    COL_NAME(fkc.referenced_object_id, fkc.referenced_column_id) \
             FROM sys.foreign_keys fk \
             JOIN sys.foreign_key_columns fkc ON fk.object_id = fkc.constraint_object_id {}",
            filter
        )
    }
}

pub struct MssqlConnection {
    client: Option<MssqlClient>,
    spid: Option<String>,
}

impl MssqlConnection {
    fn client(&mut self) -> Result<&mut MssqlClient, DriverError> {
        self.client
            .as_mut()
            .ok_or_else(|| DriverError::new(DriverErrorClass::Network, "connection is closed"))
    }
}

#[async_trait::async_trait]
impl DriverConnection for MssqlConnection {
    fn session_id(&self) -> Option<&str> {
        self.spid.as_deref()
    }

    async fn ping(&mut self) -> Result<(), DriverError> {
        self.client()?
            .simple_query(DatabaseType::Mssql.ping_sql())
            .await
            .map_err(map_error)?
            .into_first_result()
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn set_statement_timeout(&mut self, timeout_ms: u64) -> Result<bool, DriverError> {
        self.client()?
            .execute(format!("SET LOCK_TIMEOUT {}", timeout_ms), &[])
            .await
            .map_err(map_error)?;
        Ok(true)
    }

    async fn query(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        max_rows: Option<usize>,
    ) -> Result<RowSet, DriverError> {
        let wrapped: Vec<MssqlParam<'_>> = params.iter().map(MssqlParam).collect();
        let refs: Vec<&dyn ToSql> = wrapped.iter().map(|p| p as &dyn ToSql).collect();

        let mut stream = self.client()?.query(sql, &refs).await.map_err(map_error)?;

        let columns = stream
            .columns()
            .await
            .map_err(map_error)?
            .map(|cols| {
                cols.iter()
                    .map(|col| ColumnInfo::new(col.name(), format!("{:?}", col.column_type())))
                    .collect()
            })
            .unwrap_or_default();

        let mut rows = Vec::new();
        let mut has_more = false;
        let mut row_stream = stream.into_row_stream();
        while let Some(row) = row_stream.try_next().await.map_err(map_error)? {
            if max_rows.map_or(false, |limit| rows.len() >= limit) {
                has_more = true;
                break;
            }
            rows.push(convert_row(&row));
        }

        Ok(RowSet {
            columns,
            rows,
            has_more,
        })
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                tracing::debug!("Error while closing SQL Server session: {}", e);
            }
        }
    }
}
