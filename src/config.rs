use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Serialize, Deserialize)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for slog::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Critical => slog::Level::Critical,
            LogLevel::Error => slog::Level::Error,
            LogLevel::Warning => slog::Level::Warning,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Trace => slog::Level::Trace,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: LogLevel,
    /// PostgreSQL connection string.
    pub database: String,
    /// Download cache directory; defaults to ~/.cache/symboldb.
    pub cache: Option<std::path::PathBuf>,
    pub download_threads: usize,
    #[serde(with = "serde_regex")]
    pub exclude_name: Option<regex::Regex>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            database: "host=/var/run/postgresql dbname=symboldb".to_owned(),
            cache: None,
            download_threads: 3,
            exclude_name: None,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.download_threads == 0 {
            bail!("download_threads must not be zero");
        }
        Ok(())
    }

    pub fn read(file: &str) -> Result<Self> {
        let config = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to load config file {:?}", file))?;
        let config: Self = serde_yaml::from_str(&config)
            .with_context(|| format!("Failed to parse config file {:?}", file))?;

        config.validate()?;
        Ok(config)
    }

    /// Reads the config file if it exists; otherwise the defaults.
    pub fn load(file: &str) -> Result<Self> {
        if std::path::Path::new(file).exists() {
            Self::read(file)
        } else {
            Ok(Self::default())
        }
    }
}

#[test]
fn test_defaults_and_parse() {
    let config = Config::load("/nonexistent/symboldb.yaml").unwrap();
    assert_eq!(config.download_threads, 3);
    assert!(config.exclude_name.is_none());

    let config: Config = serde_yaml::from_str(
        "log_level: Debug\ndownload_threads: 8\nexclude_name: '^kernel'\n",
    )
    .unwrap();
    assert_eq!(config.download_threads, 8);
    assert!(config.exclude_name.unwrap().is_match("kernel-core"));
}
