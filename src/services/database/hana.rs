// SAP HANA driver over hdbconnect_async.
//
// HANA has no per-statement server timeout directive reachable from a plain
// session, so only the client deadline applies. Bind parameters use `?`.

use hdbconnect_async::{ConnectParams, Connection, HdbError, HdbValue, ServerCerts};
use serde_json::{json, Value};

use super::driver::{
    is_plain_identifier, DatabaseDriver, DriverConnection, DriverError, DriverErrorClass,
};
use crate::models::{ColumnInfo, DatabaseProfile, DatabaseType, QueryParam, RowSet};

/// Classify a HANA server error code.
pub(crate) fn classify_hana_code(code: i64) -> DriverErrorClass {
    match code {
        // lock wait timeout, deadlock detected, transaction rolled back by lock timeout
        131 | 133 | 146 => DriverErrorClass::Deadlock,
        // session/connection failures reported by the server
        129 | 138 | 613 | 1033 => DriverErrorClass::Network,
        10 | 414 | 591 => DriverErrorClass::Authentication,
        257 | 259 | 260 | 328 => DriverErrorClass::Syntax,
        258 => DriverErrorClass::Permission,
        287 | 301 | 461 | 462 => DriverErrorClass::Constraint,
        139 => DriverErrorClass::Timeout,
        _ => DriverErrorClass::Other,
    }
}

fn map_error(err: HdbError) -> DriverError {
    let message = err.to_string();
    if let Some(server_error) = err.server_error() {
        let code = i64::from(server_error.code());
        return DriverError::new(classify_hana_code(code), message).with_code(code);
    }
    // everything that is not a server error happened on the wire or in the client
    let lower = message.to_lowercase();
    let class = if lower.contains("timed out") || lower.contains("timeout") {
        DriverErrorClass::ConnectTimeout
    } else if lower.contains("tcp")
        || lower.contains("connection")
        || lower.contains("broken pipe")
        || lower.contains("reset")
        || lower.contains("i/o")
    {
        DriverErrorClass::Network
    } else {
        DriverErrorClass::Other
    };
    DriverError::new(class, message)
}

fn convert_value(value: HdbValue<'static>) -> Value {
    match value {
        HdbValue::NULL => Value::Null,
        HdbValue::TINYINT(v) => json!(v),
        HdbValue::SMALLINT(v) => json!(v),
        HdbValue::INT(v) => json!(v),
        HdbValue::BIGINT(v) => json!(v),
        HdbValue::REAL(v) => json!(v),
        HdbValue::DOUBLE(v) => json!(v),
        HdbValue::BOOLEAN(v) => json!(v),
        HdbValue::STRING(v) => json!(v),
        other => json!(other.to_string()),
    }
}

pub struct HanaDriver;

impl HanaDriver {
    pub fn new() -> Self {
        Self
    }

    fn connect_params(profile: &DatabaseProfile) -> Result<ConnectParams, DriverError> {
        let mut builder = ConnectParams::builder();
        builder
            .hostname(&profile.host)
            .port(profile.port)
            .dbuser(&profile.credentials.username)
            .password(&profile.credentials.password);
        if profile.option_flag("encrypt") {
            builder.tls_with(ServerCerts::RootCertificates);
        }
        builder.build().map_err(map_error)
    }
}

impl Default for HanaDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DatabaseDriver for HanaDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Hana
    }

    async fn connect(
        &self,
        profile: &DatabaseProfile,
    ) -> Result<Box<dyn DriverConnection>, DriverError> {
        let params = Self::connect_params(profile)?;
        let connection = Connection::new(params).await.map_err(map_error)?;

        if let Some(schema) = profile.default_schema.as_deref() {
            if is_plain_identifier(schema) {
                connection
                    .exec(format!("SET SCHEMA \"{}\"", schema))
                    .await
                    .map_err(map_error)?;
            } else {
                tracing::warn!("Ignoring default schema with unexpected characters: {}", schema);
            }
        }

        let mut session = connection
            .query("SELECT CURRENT_CONNECTION FROM DUMMY")
            .await
            .map_err(map_error)?;
        let session_id = session
            .next_row()
            .await
            .map_err(map_error)?
            .and_then(|row| row.into_iter().next())
            .map(|value| match convert_value(value) {
                Value::String(s) => s,
                other => other.to_string(),
            });

        tracing::debug!(
            "Opened HANA session {} to {}",
            session_id.as_deref().unwrap_or("?"),
            profile.masked_target()
        );

        Ok(Box::new(HanaConnection {
            connection: Some(connection),
            session_id,
        }))
    }

    fn cancel_sql(&self, session_id: &str) -> Option<String> {
        if session_id.chars().all(|c| c.is_ascii_digit()) && !session_id.is_empty() {
            Some(format!("ALTER SYSTEM CANCEL SESSION '{}'", session_id))
        } else {
            None
        }
    }

    fn columns_sql(&self, profile: &DatabaseProfile) -> String {
        let schema_filter = match profile.default_schema.as_deref().filter(|s| is_plain_identifier(s)) {
            Some(schema) => format!("c.SCHEMA_NAME = '{}'", schema),
            None => "c.SCHEMA_NAME = CURRENT_SCHEMA".to_string(),
        };
        format!(
            "SELECT c.SCHEMA_NAME, c.TABLE_NAME, c.COLUMN_NAME, c.DATA_TYPE_NAME, \
                    CASE WHEN c.IS_NULLABLE = 'TRUE' THEN 1 ELSE 0 END, \
                    CASE WHEN k.COLUMN_NAME IS NULL THEN 0 ELSE 1 END \
             FROM SYS.TABLE_COLUMNS c \
             LEFT JOIN SYS.CONSTRAINTS k \
               ON k.SCHEMA_NAME = c.SCHEMA_NAME AND k.TABLE_NAME = c.TABLE_NAME \
              AND k.COLUMN_NAME = c.COLUMN_NAME AND k.IS_PRIMARY_KEY = 'TRUE' \
             WHERE {} \
             ORDER BY c.SCHEMA_NAME, c.TABLE_NAME, c.POSITION",
            schema_filter
        )
    }

    fn foreign_keys_sql(&self, profile: &DatabaseProfile) -> String {
        let schema_filter = match profile.default_schema.as_deref().filter(|s| is_plain_identifier(s)) {
            Some(schema) => format!("SCHEMA_NAME = '{}'", schema),
            None => "SCHEMA_NAME = CURRENT_SCHEMA".to_string(),
        };
        format!(
            "SELECT SCHEMA_NAME, TABLE_NAME, COLUMN_NAME, REFERENCED_TABLE_NAME, REFERENCED_COLUMN_NAME \
             FROM SYS.REFERENTIAL_CONSTRAINTS WHERE {}",
            schema_filter
        )
    }
}

pub struct HanaConnection {
    connection: Option<Connection>,
    session_id: Option<String>,
}

impl HanaConnection {
    fn connection(&self) -> Result<&Connection, DriverError> {
        self.connection
            .as_ref()
            .ok_or_else(|| DriverError::new(DriverErrorClass::Network, "connection is closed"))
    }
}

#[async_trait::async_trait]
impl DriverConnection for HanaConnection {
    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    async fn ping(&mut self) -> Result<(), DriverError> {
        self.connection()?
            .query(DatabaseType::Hana.ping_sql())
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn set_statement_timeout(&mut self, _timeout_ms: u64) -> Result<bool, DriverError> {
        Ok(false)
    }

    async fn query(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        max_rows: Option<usize>,
    ) -> Result<RowSet, DriverError> {
        let connection = self.connection()?;
        let mut result_set = if params.is_empty() {
            connection.query(sql).await.map_err(map_error)?
        } else {
            let mut statement = connection.prepare(sql).await.map_err(map_error)?;
            statement
                .execute(&params.to_vec())
                .await
                .map_err(map_error)?
                .into_resultset()
                .map_err(map_error)?
        };

        let columns = result_set
            .metadata()
            .iter()
            .map(|field| ColumnInfo::new(field.displayname(), format!("{:?}", field.type_id())))
            .collect();

        let mut rows = Vec::new();
        let mut has_more = false;
        while let Some(row) = result_set.next_row().await.map_err(map_error)? {
            if max_rows.map_or(false, |limit| rows.len() >= limit) {
                has_more = true;
                break;
            }
            rows.push(row.into_iter().map(convert_value).collect());
        }

        Ok(RowSet {
            columns,
            rows,
            has_more,
        })
    }

    async fn close(&mut self) {
        // the session is disconnected when the connection is dropped
        self.connection.take();
    }
}
