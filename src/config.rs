use clap::Parser;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    DuckDb,
    /// SQL Server flavour: dry runs use `TOP 0`.
    TSql,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub connection_string: String,
    pub pool_size: usize,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_dialect")]
    pub dialect: SqlDialect,
    #[serde(default = "default_predefined_table")]
    pub predefined_table: String,
    #[serde(default = "default_max_result_rows")]
    pub max_result_rows: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub backend: String, // "remote", "azure", "ollama" or "disabled"
    pub model: String,   // Model or deployment name
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub api_version: Option<String>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_freshness_threshold")]
    pub freshness_threshold_days: i64,
    /// Ordered by preference when measuring freshness.
    #[serde(default = "default_audit_columns")]
    pub audit_columns: Vec<String>,
    /// Comma separated; empty means every table in the schema.
    #[serde(default)]
    pub allowed_tables: String,
    #[serde(default = "default_generation_attempts")]
    pub max_generation_attempts: u32,
    #[serde(default = "default_correction_attempts")]
    pub max_correction_attempts: u32,
}

impl PipelineConfig {
    pub fn allowed_table_list(&self) -> Vec<String> {
        self.allowed_tables
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct KnowledgeConfig {
    pub path: Option<PathBuf>,
    #[serde(default = "default_knowledge_results")]
    pub max_results: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupportConfig {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub extension: String,
}

impl SupportConfig {
    /// Appended to answers whose failure points at a missing table or column.
    pub fn contact_message(&self) -> String {
        format!(
            "\n\nIf this field should exist, please contact the data support team: {} ({}), phone {} ext. {}.",
            self.name, self.email, self.phone, self.extension
        )
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    pub support: SupportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// DuckDB database file (or :memory:)
    #[arg(long)]
    pub database: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}

fn default_schema() -> String {
    "main".to_string()
}

fn default_dialect() -> SqlDialect {
    SqlDialect::DuckDb
}

fn default_predefined_table() -> String {
    "predefined_queries".to_string()
}

fn default_max_result_rows() -> usize {
    1000
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_freshness_threshold() -> i64 {
    3
}

fn default_audit_columns() -> Vec<String> {
    ["LAST_UPDATED_TS", "UPDATED_AT", "INSERTED_ON", "CREATED_AT"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

fn default_generation_attempts() -> u32 {
    2
}

fn default_correction_attempts() -> u32 {
    1
}

fn default_knowledge_results() -> usize {
    8
}

fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
    d: &AppConfig,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("database.connection_string", d.database.connection_string.as_str())?
        .set_default("database.pool_size", d.database.pool_size as u64)?
        .set_default("database.schema", d.database.schema.as_str())?
        .set_default("database.dialect", "duckdb")?
        .set_default("database.predefined_table", d.database.predefined_table.as_str())?
        .set_default("database.max_result_rows", d.database.max_result_rows as u64)?
        .set_default("web.host", d.web.host.as_str())?
        .set_default("web.port", d.web.port as u64)?
        .set_default("llm.backend", d.llm.backend.as_str())?
        .set_default("llm.model", d.llm.model.as_str())?
        .set_default("llm.temperature", d.llm.temperature as f64)?
        .set_default("llm.timeout_secs", d.llm.timeout_secs)?
        .set_default(
            "pipeline.freshness_threshold_days",
            d.pipeline.freshness_threshold_days,
        )?
        .set_default("pipeline.audit_columns", d.pipeline.audit_columns.clone())?
        .set_default("pipeline.allowed_tables", d.pipeline.allowed_tables.as_str())?
        .set_default(
            "pipeline.max_generation_attempts",
            d.pipeline.max_generation_attempts as u64,
        )?
        .set_default(
            "pipeline.max_correction_attempts",
            d.pipeline.max_correction_attempts as u64,
        )?
        .set_default("knowledge.max_results", d.knowledge.max_results as u64)?
        .set_default("support.name", d.support.name.as_str())?
        .set_default("support.email", d.support.email.as_str())?
        .set_default("support.phone", d.support.phone.as_str())?
        .set_default("support.extension", d.support.extension.as_str())?
        .set_default("logging.format", "text")
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        // Defaults first so a partial file still yields a complete config
        let mut config_builder = with_defaults(Config::builder(), &AppConfig::default())?;

        // Add configuration from file if specified
        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            // Check for config in default locations
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/nl-report/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // NL_REPORT__LLM__API_KEY and friends
        config_builder = config_builder.add_source(
            Environment::with_prefix("NL_REPORT")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("pipeline.audit_columns")
                .try_parsing(true),
        );

        // Build the config
        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Override with command line args if provided
        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(database) = &args.database {
            config.database.connection_string = database.clone();
        }
        if args.json_logs {
            config.logging.format = LogFormat::Json;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.max_generation_attempts != 2 {
            return Err(ConfigError::Message(format!(
                "pipeline.max_generation_attempts must be 2, got {}",
                self.pipeline.max_generation_attempts
            )));
        }
        if self.pipeline.max_correction_attempts != 1 {
            return Err(ConfigError::Message(format!(
                "pipeline.max_correction_attempts must be 1, got {}",
                self.pipeline.max_correction_attempts
            )));
        }
        if self.pipeline.freshness_threshold_days < 0 {
            return Err(ConfigError::Message(
                "pipeline.freshness_threshold_days cannot be negative".to_string(),
            ));
        }
        Ok(())
    }
}

// Default implementation
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                connection_string: "nl-report.db".to_string(),
                pool_size: 5,
                schema: default_schema(),
                dialect: default_dialect(),
                predefined_table: default_predefined_table(),
                max_result_rows: default_max_result_rows(),
            },
            web: WebConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            llm: LlmConfig {
                backend: "disabled".to_string(),
                model: "gpt-4o".to_string(),
                api_key: None,
                api_url: None,
                api_version: None,
                temperature: 0.0,
                timeout_secs: default_llm_timeout(),
            },
            pipeline: PipelineConfig {
                freshness_threshold_days: default_freshness_threshold(),
                audit_columns: default_audit_columns(),
                allowed_tables: String::new(),
                max_generation_attempts: default_generation_attempts(),
                max_correction_attempts: default_correction_attempts(),
            },
            knowledge: KnowledgeConfig {
                path: None,
                max_results: default_knowledge_results(),
            },
            support: SupportConfig {
                name: "Data Support".to_string(),
                email: "data-support@example.com".to_string(),
                phone: "000-000-0000".to_string(),
                extension: "0000".to_string(),
            },
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_partial_file_over_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
connection_string = ":memory:"
dialect = "tsql"

[pipeline]
freshness_threshold_days = 7
audit_columns = ["LAST_UPDATED_TS"]
allowed_tables = "accounts, customers"
"#
        )
        .unwrap();

        let args = CliArgs {
            config: Some(file.path().to_path_buf()),
            port: Some(8080),
            ..Default::default()
        };
        let config = AppConfig::new(&args).unwrap();

        assert_eq!(config.database.connection_string, ":memory:");
        assert_eq!(config.database.dialect, SqlDialect::TSql);
        assert_eq!(config.database.pool_size, 5);
        assert_eq!(config.web.port, 8080);
        assert_eq!(config.pipeline.freshness_threshold_days, 7);
        assert_eq!(config.pipeline.audit_columns, vec!["LAST_UPDATED_TS"]);
        assert_eq!(
            config.pipeline.allowed_table_list(),
            vec!["accounts".to_string(), "customers".to_string()]
        );
    }

    #[test]
    fn rejects_changed_attempt_limits() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[pipeline]\nmax_correction_attempts = 3").unwrap();

        let args = CliArgs {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(AppConfig::new(&args).is_err());
    }

    #[test]
    fn default_pipeline_settings() {
        let config = AppConfig::default();
        assert_eq!(config.pipeline.freshness_threshold_days, 3);
        assert!(config.pipeline.allowed_table_list().is_empty());
        assert!(config.support.contact_message().contains("data-support@example.com"));
    }
}
