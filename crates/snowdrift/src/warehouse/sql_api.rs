//! Snowflake SQL API v2 executor.
//!
//! Statements are submitted with `POST /api/v2/statements`. Long running
//! statements answer `202 Accepted` and are polled through their status URL.
//! Results larger than one partition are fetched partition by partition.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::debug;

use super::{BulkLoad, ColumnMeta, LoadCounts, MAX_CATALOG_ROWS, TableMeta, Warehouse, dialect, normalize_data_type};
use crate::config::{Config, FileFormatType};
use crate::error::{
    ConfigError, DecodeSnafu, FileFormatNotFoundSnafu, FileFormatUnsupportedSnafu, RequestSnafu,
    TooManyRecordsSnafu, UnsupportedSnafu, WarehouseError,
};
use crate::metrics::events::{WarehouseRequest, WarehouseRequestDuration};
use crate::naming::query_tag;
use snowdrift_core::emit;

/// Error codes reported for objects that do not exist or are not visible.
const NOT_FOUND_CODES: &[&str] = &["002003", "002043"];

/// Connection settings of the SQL API executor.
#[derive(Debug, Clone)]
pub struct SqlApiSettings {
    pub base_url: String,
    pub token: String,
    pub token_type: String,
    pub database: String,
    pub warehouse: String,
    pub role: Option<String>,
    pub timeout_secs: u64,
    pub query_tag: Option<String>,
    pub poll_interval: Duration,
}

impl SqlApiSettings {
    /// Read connection keys, failing on the first one that is missing.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let base_url = match &config.sql_api_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let account = Config::required(&config.account, "account")?;
                format!("https://{account}.snowflakecomputing.com")
            }
        };

        Ok(Self {
            base_url,
            token: Config::required(&config.sql_api_token, "sql_api_token")?.to_string(),
            token_type: config.sql_api_token_type.clone(),
            database: Config::required(&config.dbname, "dbname")?.to_string(),
            warehouse: Config::required(&config.warehouse, "warehouse")?.to_string(),
            role: config.role.clone(),
            timeout_secs: config.sql_api_timeout_secs,
            query_tag: config.query_tag.clone(),
            poll_interval: Duration::from_millis(500),
        })
    }
}

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    timeout: u64,
    database: &'a str,
    warehouse: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parameters: StatementParameters<'a>,
}

#[derive(Debug, Serialize)]
struct StatementParameters<'a> {
    #[serde(rename = "QUERY_TAG", skip_serializing_if = "Option::is_none")]
    query_tag: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    statement_status_url: Option<String>,
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    row_type: Vec<RowType>,
    #[serde(default)]
    partition_info: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RowType {
    name: String,
}

/// Rows of a statement result, all values as text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    fn index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(column))
    }

    /// Values of one column, `None` for SQL nulls and unknown columns.
    pub fn values<'a>(&'a self, column: &str) -> impl Iterator<Item = Option<&'a str>> + use<'a> {
        let index = self.index(column);
        self.rows
            .iter()
            .map(move |row| index.and_then(|i| row.get(i)).and_then(|v| v.as_deref()))
    }

    fn sum(&self, column: &str) -> u64 {
        self.values(column)
            .filter_map(|v| v.and_then(|v| v.parse::<u64>().ok()))
            .sum()
    }

    fn first_count(&self, column: &str) -> u64 {
        self.values(column)
            .next()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn strings(&self, column: &str) -> Vec<String> {
        self.values(column).flatten().map(str::to_string).collect()
    }
}

fn decode_columns(result: &ResultSet) -> Vec<ColumnMeta> {
    let schemas = result.values("schema_name");
    let tables = result.values("table_name");
    let names = result.values("column_name");
    let types = result.values("data_type");
    schemas
        .zip(tables)
        .zip(names)
        .zip(types)
        .filter_map(|(((schema, table), column), data_type)| {
            Some(ColumnMeta {
                schema_name: schema?.to_uppercase(),
                table_name: table?.to_uppercase(),
                column_name: column?.to_uppercase(),
                data_type: normalize_data_type(data_type.unwrap_or("TEXT")),
            })
        })
        .collect()
}

fn decode_tables(result: &ResultSet) -> Vec<TableMeta> {
    result
        .values("schema_name")
        .zip(result.values("name"))
        .filter_map(|(schema, table)| {
            Some(TableMeta {
                schema_name: schema?.to_uppercase(),
                table_name: table?.to_uppercase(),
            })
        })
        .collect()
}

fn decode_file_format(name: &str, result: &ResultSet) -> Result<FileFormatType, WarehouseError> {
    let kind = result
        .values("type")
        .next()
        .flatten()
        .context(FileFormatNotFoundSnafu { name })?;
    match kind.to_uppercase().as_str() {
        "CSV" => Ok(FileFormatType::Csv),
        "PARQUET" => Ok(FileFormatType::Parquet),
        other => FileFormatUnsupportedSnafu { name, kind: other }.fail(),
    }
}

/// Map an unsuccessful response to a warehouse error.
fn api_error(status: u16, code: Option<String>, message: Option<String>) -> WarehouseError {
    let code = code.unwrap_or_default();
    let message = message.unwrap_or_default();
    if NOT_FOUND_CODES.contains(&code.as_str()) && message.contains("does not exist") {
        WarehouseError::NotFound { message }
    } else {
        WarehouseError::Api { status, code, message }
    }
}

/// Warehouse collaborator backed by the Snowflake SQL API.
#[derive(Clone)]
pub struct SqlApiWarehouse {
    client: reqwest::Client,
    settings: Arc<SqlApiSettings>,
    query_tag: Option<String>,
}

impl std::fmt::Debug for SqlApiWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlApiWarehouse")
            .field("base_url", &self.settings.base_url)
            .field("database", &self.settings.database)
            .field("query_tag", &self.query_tag)
            .finish()
    }
}

impl SqlApiWarehouse {
    pub fn new(settings: SqlApiSettings) -> Self {
        let query_tag = query_tag(settings.query_tag.as_deref(), Some(&settings.database), None, None);
        Self {
            client: reqwest::Client::new(),
            settings: Arc::new(settings),
            query_tag,
        }
    }

    /// Copy of this executor whose query tag names `schema` and `table`.
    fn tagged(&self, schema: &str, table: &str) -> Self {
        Self {
            client: self.client.clone(),
            settings: self.settings.clone(),
            query_tag: query_tag(
                self.settings.query_tag.as_deref(),
                Some(&self.settings.database),
                Some(schema),
                Some(table),
            ),
        }
    }

    fn request_body<'a>(&'a self, statement: &'a str) -> StatementRequest<'a> {
        StatementRequest {
            statement,
            timeout: self.settings.timeout_secs,
            database: &self.settings.database,
            warehouse: &self.settings.warehouse,
            role: self.settings.role.as_deref(),
            parameters: StatementParameters {
                query_tag: self.query_tag.as_deref(),
            },
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&self.settings.token)
            .header("X-Snowflake-Authorization-Token-Type", &self.settings.token_type)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.settings.base_url, path)
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(StatusCode, StatementResponse), WarehouseError> {
        let response = self.authorized(request).send().await.context(RequestSnafu)?;
        let status = response.status();
        let body = response.bytes().await.context(RequestSnafu)?;
        let parsed = if body.is_empty() {
            StatementResponse::default()
        } else {
            serde_json::from_slice(&body).map_err(|err| WarehouseError::Decode {
                message: format!("{err}: {}", String::from_utf8_lossy(&body)),
            })?
        };
        Ok((status, parsed))
    }

    /// Run one statement and collect every row of its result.
    pub async fn execute(&self, statement: &str, max_rows: Option<usize>) -> Result<ResultSet, WarehouseError> {
        let start = Instant::now();
        let result = self.execute_inner(statement, max_rows).await;
        emit!(WarehouseRequest { success: result.is_ok() });
        emit!(WarehouseRequestDuration { duration: start.elapsed() });
        result
    }

    async fn execute_inner(&self, statement: &str, max_rows: Option<usize>) -> Result<ResultSet, WarehouseError> {
        debug!(statement, "Submitting statement");
        let submit = self
            .client
            .post(self.url("/api/v2/statements"))
            .json(&self.request_body(statement));
        let (mut status, mut response) = self.send(submit).await?;

        while status == StatusCode::ACCEPTED {
            let status_url = response
                .statement_status_url
                .clone()
                .or_else(|| {
                    response
                        .statement_handle
                        .as_ref()
                        .map(|h| format!("/api/v2/statements/{h}"))
                })
                .context(DecodeSnafu {
                    message: "accepted statement without a status URL",
                })?;
            tokio::time::sleep(self.settings.poll_interval).await;
            (status, response) = self.send(self.client.get(self.url(&status_url))).await?;
        }

        if !status.is_success() {
            return Err(api_error(status.as_u16(), response.code, response.message));
        }

        let meta = response.result_set_meta_data.unwrap_or_default();
        let mut result = ResultSet {
            columns: meta.row_type.into_iter().map(|r| r.name).collect(),
            rows: response.data,
        };

        if meta.partition_info.len() > 1 {
            let handle = response.statement_handle.context(DecodeSnafu {
                message: "partitioned result without a statement handle",
            })?;
            for partition in 1..meta.partition_info.len() {
                let url = self.url(&format!("/api/v2/statements/{handle}?partition={partition}"));
                let (status, page) = self.send(self.client.get(url)).await?;
                if !status.is_success() {
                    return Err(api_error(status.as_u16(), page.code, page.message));
                }
                result.rows.extend(page.data);
            }
        }

        if let Some(max) = max_rows {
            ensure!(result.rows.len() <= max, TooManyRecordsSnafu { max });
        }
        Ok(result)
    }

    async fn catalog(&self, statement: &str) -> Result<ResultSet, WarehouseError> {
        self.execute(statement, Some(MAX_CATALOG_ROWS)).await
    }
}

#[async_trait]
impl Warehouse for SqlApiWarehouse {
    async fn execute_ddl(&self, statement: &str) -> Result<(), WarehouseError> {
        self.execute(statement, None).await.map(|_| ())
    }

    async fn show_schemas(&self, like: &str) -> Result<Vec<String>, WarehouseError> {
        let result = self.catalog(&dialect::show_schemas(like)).await?;
        Ok(result.strings("name"))
    }

    async fn show_tables(&self, schema: &str) -> Result<Vec<TableMeta>, WarehouseError> {
        let statement = dialect::show_tables(Some(&self.settings.database), schema);
        Ok(decode_tables(&self.catalog(&statement).await?))
    }

    async fn show_columns(&self, schema: &str) -> Result<Vec<ColumnMeta>, WarehouseError> {
        let statement = dialect::show_columns(Some(&self.settings.database), schema);
        Ok(decode_columns(&self.catalog(&statement).await?))
    }

    async fn show_primary_keys(&self, table: &str) -> Result<Vec<String>, WarehouseError> {
        let result = self.catalog(&dialect::show_primary_keys(table)).await?;
        Ok(result
            .strings("column_name")
            .into_iter()
            .map(|c| c.to_uppercase())
            .collect())
    }

    async fn file_format_type(&self, name: &str) -> Result<FileFormatType, WarehouseError> {
        let result = self.catalog(&dialect::show_file_formats(name)).await?;
        decode_file_format(name, &result)
    }

    async fn upsert(&self, load: &BulkLoad) -> Result<LoadCounts, WarehouseError> {
        let statement = dialect::merge(load);
        debug!(statement = %statement, "Running merge");
        let result = self.execute(&statement, None).await?;
        Ok(LoadCounts {
            inserted: result.first_count("number of rows inserted"),
            updated: result.first_count("number of rows updated"),
        })
    }

    async fn append(&self, load: &BulkLoad) -> Result<LoadCounts, WarehouseError> {
        let statement = dialect::copy(load);
        debug!(statement = %statement, "Running copy");
        let result = self.execute(&statement, None).await?;
        Ok(LoadCounts {
            inserted: result.sum("rows_loaded"),
            updated: 0,
        })
    }

    async fn delete_rows(&self, table: &str) -> Result<u64, WarehouseError> {
        let result = self.execute(&dialect::delete_soft_deleted(table), None).await?;
        Ok(result.first_count("number of rows deleted"))
    }

    fn supports_file_transfer(&self) -> bool {
        false
    }

    async fn put_file(&self, _path: &Path, _stage: &str) -> Result<(), WarehouseError> {
        UnsupportedSnafu { operation: "PUT" }.fail()
    }

    async fn remove_file(&self, _stage: &str, _key: &str) -> Result<(), WarehouseError> {
        UnsupportedSnafu { operation: "REMOVE" }.fail()
    }

    fn scoped(&self, schema: &str, table: &str) -> Arc<dyn Warehouse> {
        Arc::new(self.tagged(schema, table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(columns: &[&str], rows: Vec<Vec<Option<&str>>>) -> ResultSet {
        ResultSet {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .into_iter()
                .map(|r| r.into_iter().map(|v| v.map(str::to_string)).collect())
                .collect(),
        }
    }

    fn settings() -> SqlApiSettings {
        SqlApiSettings {
            base_url: "https://acct.snowflakecomputing.com".to_string(),
            token: "token".to_string(),
            token_type: "OAUTH".to_string(),
            database: "ANALYTICS".to_string(),
            warehouse: "LOADING".to_string(),
            role: None,
            timeout_secs: 60,
            query_tag: Some("snowdrift {{database}}.{{schema}}.{{table}}".to_string()),
            poll_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_decode_columns() {
        let rs = result(
            &["table_name", "schema_name", "column_name", "data_type", "null?"],
            vec![
                vec![Some("orders"), Some("raw"), Some("id"), Some(r#"{"type":"FIXED","precision":38}"#), Some("true")],
                vec![Some("ORDERS"), Some("RAW"), Some("AMOUNT"), Some(r#"{"type":"REAL"}"#), None],
                vec![None, Some("RAW"), Some("BROKEN"), None, None],
            ],
        );
        assert_eq!(
            decode_columns(&rs),
            vec![
                ColumnMeta {
                    schema_name: "RAW".to_string(),
                    table_name: "ORDERS".to_string(),
                    column_name: "ID".to_string(),
                    data_type: "NUMBER".to_string(),
                },
                ColumnMeta {
                    schema_name: "RAW".to_string(),
                    table_name: "ORDERS".to_string(),
                    column_name: "AMOUNT".to_string(),
                    data_type: "FLOAT".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_decode_tables_and_counts() {
        let rs = result(&["created_on", "name", "kind", "database_name", "schema_name"], vec![vec![
            Some("2024-01-01"),
            Some("orders"),
            Some("TABLE"),
            Some("ANALYTICS"),
            Some("raw"),
        ]]);
        assert_eq!(
            decode_tables(&rs),
            vec![TableMeta {
                schema_name: "RAW".to_string(),
                table_name: "ORDERS".to_string()
            }]
        );

        let merged = result(&["number of rows inserted", "number of rows updated"], vec![vec![Some("3"), Some("2")]]);
        assert_eq!(merged.first_count("number of rows inserted"), 3);
        assert_eq!(merged.first_count("number of rows updated"), 2);

        let copied = result(&["file", "status", "rows_loaded"], vec![
            vec![Some("a"), Some("LOADED"), Some("10")],
            vec![Some("b"), Some("LOADED"), Some("5")],
        ]);
        assert_eq!(copied.sum("rows_loaded"), 15);
        assert_eq!(ResultSet::default().first_count("rows_loaded"), 0);
    }

    #[test]
    fn test_decode_file_format() {
        let csv = result(&["name", "type"], vec![vec![Some("CSV_FORMAT"), Some("CSV")]]);
        assert_eq!(decode_file_format("f", &csv).unwrap(), FileFormatType::Csv);

        let json_format = result(&["name", "type"], vec![vec![Some("J"), Some("JSON")]]);
        assert!(matches!(
            decode_file_format("f", &json_format).unwrap_err(),
            WarehouseError::FileFormatUnsupported { kind, .. } if kind == "JSON"
        ));
        assert!(matches!(
            decode_file_format("f", &ResultSet::default()).unwrap_err(),
            WarehouseError::FileFormatNotFound { .. }
        ));
    }

    #[test]
    fn test_api_error_mapping() {
        let missing = api_error(
            422,
            Some("002003".to_string()),
            Some("SQL compilation error:\nSchema 'ANALYTICS.RAW' does not exist or not authorized.".to_string()),
        );
        assert!(missing.is_not_found());

        let denied = api_error(422, Some("003001".to_string()), Some("Insufficient privileges".to_string()));
        assert!(matches!(denied, WarehouseError::Api { status: 422, .. }));

        let other = api_error(500, None, None);
        assert!(!other.is_not_found());
    }

    #[test]
    fn test_request_body() {
        let warehouse = SqlApiWarehouse::new(settings());
        let body = serde_json::to_value(warehouse.request_body("SELECT 1")).unwrap();
        assert_eq!(
            body,
            json!({
                "statement": "SELECT 1",
                "timeout": 60,
                "database": "ANALYTICS",
                "warehouse": "LOADING",
                "parameters": {"QUERY_TAG": "snowdrift ANALYTICS.."}
            })
        );
    }

    #[test]
    fn test_response_decoding() {
        let body = json!({
            "code": "090001",
            "statementHandle": "01b2",
            "resultSetMetaData": {
                "numRows": 1,
                "rowType": [{"name": "name", "type": "text"}],
                "partitionInfo": [{"rowCount": 1}]
            },
            "data": [["RAW"]]
        });
        let parsed: StatementResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.statement_handle.as_deref(), Some("01b2"));
        assert_eq!(parsed.result_set_meta_data.unwrap().row_type[0].name, "name");
        assert_eq!(parsed.data, vec![vec![Some("RAW".to_string())]]);
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config::parse(
            r#"{"account": "xy123", "dbname": "DB", "warehouse": "WH", "sql_api_token": "t",
                "default_target_schema": "raw"}"#,
        )
        .unwrap();
        let settings = SqlApiSettings::from_config(&config).unwrap();
        assert_eq!(settings.base_url, "https://xy123.snowflakecomputing.com");
        assert_eq!(settings.token_type, "OAUTH");

        let config = Config::parse(r#"{"account": "xy123", "default_target_schema": "raw"}"#).unwrap();
        let err = SqlApiSettings::from_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { key } if key == "sql_api_token"));
    }

    #[tokio::test]
    async fn test_table_stage_transfers_unsupported() {
        let warehouse = SqlApiWarehouse::new(settings());
        assert!(!warehouse.supports_file_transfer());
        let err = warehouse.put_file(Path::new("/tmp/a.csv"), "raw.%\"T\"").await.unwrap_err();
        assert!(matches!(err, WarehouseError::Unsupported { operation } if operation == "PUT"));
    }

    #[test]
    fn test_scoped_query_tag() {
        let warehouse = SqlApiWarehouse::new(settings());
        let scoped = warehouse.tagged("raw", "\"ORDERS\"");
        assert_eq!(scoped.query_tag.as_deref(), Some("snowdrift ANALYTICS.raw.ORDERS"));
    }
}
