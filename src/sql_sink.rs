//! Relational logging sink.
//!
//! Each flush opens its own scoped connection, issues one parameterized
//! insert per record, and closes the connection on every exit path.

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, Database, DatabaseBackend, Statement, Value};

use crate::sinks::{SinkError, TraceSink};
use crate::trace::{TraceLevel, TraceRecord};
use crate::InvalidArgument;

/// Name of the log table the sink inserts into.
pub const LOG_TABLE: &str = "FunctionLogs";

/// Placeholder written to the `traceLevel` column, reserved for future use.
pub const SQL_TRACE_LEVEL: i32 = 100;

/// Writes trace records to a predefined relational log table.
pub struct SqlSink {
    connection_string: String,
    server_name: String,
    app_name: String,
    function_name: Option<String>,
    level: TraceLevel,
}

impl SqlSink {
    /// Creates a SQL sink.
    ///
    /// `server_name` is required by the table schema; construction fails if
    /// it or the connection string is blank.
    pub fn new(
        connection_string: impl Into<String>,
        server_name: impl Into<String>,
        app_name: impl Into<String>,
        function_name: Option<String>,
        level: TraceLevel,
    ) -> Result<Self, InvalidArgument> {
        let connection_string = connection_string.into();
        if connection_string.trim().is_empty() {
            return Err(InvalidArgument::new(
                "connection_string",
                "must not be blank",
            ));
        }

        let server_name = server_name.into();
        if server_name.trim().is_empty() {
            return Err(InvalidArgument::new("server_name", "must not be blank"));
        }

        Ok(Self {
            connection_string,
            server_name,
            app_name: app_name.into(),
            function_name,
            level,
        })
    }

    fn insert_statement(backend: DatabaseBackend) -> String {
        let placeholders = match backend {
            DatabaseBackend::Postgres => "$1, $2, $3, $4, $5, $6",
            _ => "?, ?, ?, ?, ?, ?",
        };
        format!(
            r#"INSERT INTO "{LOG_TABLE}" ("timestamp", "serverName", "appName", "functionName", "traceLevel", "message") VALUES ({placeholders})"#
        )
    }
}

#[async_trait]
impl TraceSink for SqlSink {
    async fn flush_batch(&self, records: &[TraceRecord]) -> Result<(), SinkError> {
        let kept: Vec<&TraceRecord> = records
            .iter()
            .filter(|r| r.level != TraceLevel::Off && r.level <= self.level)
            .collect();
        if kept.is_empty() {
            return Ok(());
        }

        let db = Database::connect(&self.connection_string).await?;
        let backend = db.get_database_backend();
        let sql = Self::insert_statement(backend);

        let mut outcome: Result<(), SinkError> = Ok(());
        for record in kept {
            let values: Vec<Value> = vec![
                record.timestamp.naive_utc().into(),
                self.server_name.clone().into(),
                self.app_name.clone().into(),
                self.function_name.clone().into(),
                SQL_TRACE_LEVEL.into(),
                record.message.clone().into(),
            ];
            if let Err(err) = db
                .execute(Statement::from_sql_and_values(backend, &sql, values))
                .await
            {
                outcome = Err(err.into());
                break;
            }
        }

        if let Err(err) = db.close().await {
            tracing::debug!(error = %err, "Failed to close log database connection");
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn record(level: TraceLevel, message: &str) -> TraceRecord {
        TraceRecord {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
            properties: HashMap::new(),
        }
    }

    async fn create_log_table(url: &str) {
        let db = Database::connect(url).await.unwrap();
        db.execute(Statement::from_string(
            DatabaseBackend::Sqlite,
            r#"CREATE TABLE "FunctionLogs" (
                "timestamp" TEXT NOT NULL,
                "serverName" TEXT NOT NULL,
                "appName" TEXT NOT NULL,
                "functionName" TEXT NULL,
                "traceLevel" INTEGER NOT NULL,
                "message" TEXT NOT NULL
            )"#
            .to_string(),
        ))
        .await
        .unwrap();
        db.close().await.unwrap();
    }

    #[test]
    fn test_blank_server_name_rejected() {
        let result = SqlSink::new(
            "sqlite::memory:",
            "  ",
            "app",
            None,
            TraceLevel::Info,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_blank_connection_string_rejected() {
        let result = SqlSink::new("", "server-1", "app", None, TraceLevel::Info);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_flush_inserts_one_row_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("logs.db").display());
        create_log_table(&url).await;

        let sink = SqlSink::new(
            &url,
            "instance-1",
            "site-a",
            Some("HttpTrigger".to_string()),
            TraceLevel::Verbose,
        )
        .unwrap();

        sink.flush_batch(&[
            record(TraceLevel::Info, "started"),
            record(TraceLevel::Error, "failed"),
        ])
        .await
        .unwrap();

        let db = Database::connect(&url).await.unwrap();
        let row = db
            .query_one(Statement::from_string(
                DatabaseBackend::Sqlite,
                r#"SELECT COUNT(*) AS cnt FROM "FunctionLogs""#.to_string(),
            ))
            .await
            .unwrap()
            .unwrap();
        let count: i64 = row.try_get("", "cnt").unwrap();
        assert_eq!(count, 2);

        let row = db
            .query_one(Statement::from_string(
                DatabaseBackend::Sqlite,
                r#"SELECT "serverName", "functionName", "traceLevel" FROM "FunctionLogs" LIMIT 1"#
                    .to_string(),
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.try_get::<String>("", "serverName").unwrap(), "instance-1");
        assert_eq!(
            row.try_get::<Option<String>>("", "functionName").unwrap(),
            Some("HttpTrigger".to_string())
        );
        assert_eq!(row.try_get::<i32>("", "traceLevel").unwrap(), SQL_TRACE_LEVEL);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_function_name_inserts_null() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("logs.db").display());
        create_log_table(&url).await;

        let sink = SqlSink::new(&url, "instance-1", "site-a", None, TraceLevel::Verbose).unwrap();
        sink.flush_batch(&[record(TraceLevel::Info, "host level")])
            .await
            .unwrap();

        let db = Database::connect(&url).await.unwrap();
        let row = db
            .query_one(Statement::from_string(
                DatabaseBackend::Sqlite,
                r#"SELECT "functionName" FROM "FunctionLogs""#.to_string(),
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.try_get::<Option<String>>("", "functionName").unwrap(), None);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_level_filter_applies_before_insert() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("logs.db").display());
        create_log_table(&url).await;

        let sink = SqlSink::new(&url, "instance-1", "site-a", None, TraceLevel::Warning).unwrap();
        sink.flush_batch(&[
            record(TraceLevel::Verbose, "noise"),
            record(TraceLevel::Error, "signal"),
        ])
        .await
        .unwrap();

        let db = Database::connect(&url).await.unwrap();
        let row = db
            .query_one(Statement::from_string(
                DatabaseBackend::Sqlite,
                r#"SELECT COUNT(*) AS cnt FROM "FunctionLogs""#.to_string(),
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.try_get::<i64>("", "cnt").unwrap(), 1);
        db.close().await.unwrap();
    }
}
