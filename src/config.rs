use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One saved database target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    #[serde(flatten)]
    pub backend: Backend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum Backend {
    Sqlite { path: String },
    Postgres(PostgresConfig),
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Skip certificate verification in `Prefer`/`Require` modes.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// PEM file with extra root certificates.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_pool_size() -> usize {
    8
}

fn default_connect_timeout() -> u64 {
    15
}

/// SSL/TLS connection modes, matching libpq's `sslmode`.
///
/// - `Disable`: no TLS
/// - `Prefer`: TLS, verification per `accept_invalid_certs` (default)
/// - `Require`: same as `Prefer`
/// - `VerifyCa` / `VerifyFull`: TLS with strict certificate verification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl PostgresConfig {
    pub fn connection_string(&self) -> String {
        let sslmode = match self.ssl_mode {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            // tokio-postgres only knows disable/prefer/require; verification
            // is enforced by the TLS connector instead
            SslMode::VerifyCa | SslMode::VerifyFull => "require",
        };
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout={}",
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.database),
            quote_conn_value(&self.username),
            quote_conn_value(&self.password),
            sslmode,
            self.connect_timeout_secs
        )
    }

    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 5432,
            database: String::from("postgres"),
            username: String::from("postgres"),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl DatabaseConfig {
    pub fn display_string(&self) -> String {
        match &self.backend {
            Backend::Sqlite { path } => format!("sqlite:{}", path),
            Backend::Postgres(pg) => format!("postgres:{}", pg.display_string()),
            Backend::Memory => "memory".to_string(),
        }
    }

    pub fn get_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ommi")
            .join("databases.toml")
    }

    pub fn load_saved(path: &Path) -> Result<Vec<DatabaseConfig>> {
        if !path.exists() {
            return Ok(vec![]);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let saved: SavedDatabases = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(saved.databases)
    }

    pub fn save(path: &Path, databases: &[DatabaseConfig]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let saved = SavedDatabases {
            databases: databases.to_vec(),
        };
        let content = toml::to_string_pretty(&saved)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn find(databases: Vec<DatabaseConfig>, name: &str) -> Option<DatabaseConfig> {
        databases
            .into_iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedDatabases {
    #[serde(default)]
    databases: Vec<DatabaseConfig>,
}

/// Quote a value for use in a libpq key=value connection string.
/// Wraps in single quotes and escapes backslashes and single quotes.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[databases]]
name = "local"
backend = "sqlite"
path = "app.db"

[[databases]]
name = "Warehouse"
backend = "postgres"
host = "db.internal"
port = 5433
database = "stock"
username = "reader"
ssl_mode = "VerifyFull"

[[databases]]
name = "scratch"
backend = "memory"
"#;

    #[test]
    fn test_parse_saved_databases() {
        let saved: SavedDatabases = toml::from_str(SAMPLE).unwrap();
        assert_eq!(saved.databases.len(), 3);

        match &saved.databases[0].backend {
            Backend::Sqlite { path } => assert_eq!(path, "app.db"),
            other => panic!("unexpected backend {:?}", other),
        }
        match &saved.databases[1].backend {
            Backend::Postgres(pg) => {
                assert_eq!(pg.port, 5433);
                assert_eq!(pg.ssl_mode, SslMode::VerifyFull);
                assert_eq!(pg.pool_size, 8);
                assert!(pg.password.is_empty());
            }
            other => panic!("unexpected backend {:?}", other),
        }
        assert!(matches!(saved.databases[2].backend, Backend::Memory));
    }

    #[test]
    fn test_find_is_case_insensitive() {
        let saved: SavedDatabases = toml::from_str(SAMPLE).unwrap();
        let found = DatabaseConfig::find(saved.databases, "warehouse").unwrap();
        assert_eq!(found.name, "Warehouse");
    }

    #[test]
    fn test_password_is_not_serialized() {
        let config = DatabaseConfig {
            name: "pg".into(),
            backend: Backend::Postgres(PostgresConfig {
                password: "hunter2".into(),
                ..PostgresConfig::default()
            }),
        };
        let text = toml::to_string(&SavedDatabases {
            databases: vec![config],
        })
        .unwrap();
        assert!(!text.contains("hunter2"));
        assert!(text.contains("backend = \"postgres\""));
    }

    #[test]
    fn test_connection_string_quotes_values() {
        let pg = PostgresConfig {
            password: "it's".into(),
            ..PostgresConfig::default()
        };
        let conn = pg.connection_string();
        assert!(conn.contains("password='it\\'s'"));
        assert!(conn.contains("sslmode=prefer"));
        assert!(conn.contains("connect_timeout=15"));
    }

    #[test]
    fn test_display_string() {
        let config = DatabaseConfig {
            name: "local".into(),
            backend: Backend::Sqlite {
                path: "app.db".into(),
            },
        };
        assert_eq!(config.display_string(), "sqlite:app.db");
        assert_eq!(
            PostgresConfig::default().display_string(),
            "postgres@localhost:5432/postgres"
        );
    }

    #[test]
    fn test_missing_file_is_empty() {
        let path = std::env::temp_dir().join("ommi-config-does-not-exist.toml");
        assert!(DatabaseConfig::load_saved(&path).unwrap().is_empty());
    }
}
