//! Configuration loading, pricing table defaults, and secret-file overrides.
//!
//! Settings come from an optional `config/settings` file plus `QUAESTOR`-prefixed
//! environment variables (`__` separates nesting levels). Secrets may instead be
//! provided through `{NAME}_FILE` path variants (Docker/K8s secrets); for the
//! three global price fields, presence of either the env var or its `_FILE`
//! sibling marks the field as explicitly overridden, which feeds the pricing
//! resolution precedence in `services::costs`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::services::costs::{GlobalPrices, ModelRates, PriceOverrides};

const CONFIG_FILE: &str = "config/settings";
const ENV_PREFIX: &str = "QUAESTOR";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
    #[error("secret file for `{name}` could not be read at {path}: {source}")]
    SecretFile {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("secret file for `{name}` does not contain a number: {value}")]
    SecretNotNumeric { name: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub gemini: GeminiConfig,
    pub chat: ChatConfig,
    pub watchdog: WatchdogConfig,
    pub pricing: PricingConfig,
    /// Captured once at load; not part of the config sources themselves.
    #[serde(skip)]
    pub price_overrides: PriceOverrides,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            gemini: GeminiConfig::default(),
            chat: ChatConfig::default(),
            watchdog: WatchdogConfig::default(),
            pricing: PricingConfig::default(),
            price_overrides: PriceOverrides::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    /// When true, a mock client that completes everything instantly is used.
    pub mock_mode: bool,
    pub http_timeout_s: u64,
    /// Attempts for retryable remote calls (upload, operation polls).
    pub retry_attempts: usize,
    /// Full-stream retry attempts for the chat path.
    pub stream_retry_attempts: u32,
    /// Hard ceiling for the ingestion poll loop, in seconds.
    pub ingestion_timeout_s: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            mock_mode: true,
            http_timeout_s: 60,
            retry_attempts: 3,
            stream_retry_attempts: 2,
            ingestion_timeout_s: 180,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChatConfig {
    pub default_model: String,
    pub allowed_models: Vec<String>,
    pub keepalive_secs: f64,
    pub max_concurrent_streams: usize,
    pub rate_limit_per_minute: u32,
    pub max_question_chars: usize,
    pub allow_metadata_filters: bool,
    pub metadata_filter_allowed_keys: Vec<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_model: "gemini-2.5-flash".to_string(),
            allowed_models: vec![
                "gemini-2.5-flash".to_string(),
                "gemini-2.5-pro".to_string(),
                "gemini-3.0-pro-thinking".to_string(),
                "gemini-2.0-flash".to_string(),
                "gemini-2.0-pro".to_string(),
                "gemini-1.5-pro".to_string(),
                "gemini-1.5-flash".to_string(),
            ],
            keepalive_secs: 10.0,
            max_concurrent_streams: 50,
            rate_limit_per_minute: 10,
            max_question_chars: 32_000,
            allow_metadata_filters: false,
            metadata_filter_allowed_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Documents RUNNING longer than this are considered stuck.
    pub ttl_minutes: i64,
    /// Sweep cadence when running inside the worker.
    pub cron_minutes: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: 60,
            cron_minutes: 15,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PricingConfig {
    pub price_per_mtok_input: f64,
    pub price_per_mtok_output: f64,
    pub price_per_mtok_index: f64,
    pub model_pricing: BTreeMap<String, ModelRates>,
    /// Headroom reserved before streaming so near-simultaneous requests do not
    /// jointly overshoot the monthly limit.
    pub budget_hold_usd: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            price_per_mtok_input: 0.30,
            price_per_mtok_output: 2.50,
            price_per_mtok_index: 0.0015,
            model_pricing: default_model_pricing(),
            budget_hold_usd: 0.05,
        }
    }
}

impl Settings {
    pub fn global_prices(&self) -> GlobalPrices {
        GlobalPrices {
            input: self.pricing.price_per_mtok_input,
            output: self.pricing.price_per_mtok_output,
            index: self.pricing.price_per_mtok_index,
        }
    }
}

/// Per-model USD-per-million-token rates shipped as defaults. A `default`
/// entry is mandatory and validated at load time.
pub fn default_model_pricing() -> BTreeMap<String, ModelRates> {
    let mut table = BTreeMap::new();
    // Reasoning / thinking tiers
    table.insert(
        "gemini-3.0-pro-thinking".to_string(),
        ModelRates::new(Some(2.0), Some(12.0), Some(0.0015)),
    );
    table.insert(
        "gemini-3-pro-preview".to_string(),
        ModelRates::new(Some(2.0), Some(12.0), Some(0.0015)),
    );
    // Performance tiers
    table.insert(
        "gemini-2.5-pro".to_string(),
        ModelRates::new(Some(1.25), Some(10.0), Some(0.0015)),
    );
    table.insert(
        "gemini-2.0-pro".to_string(),
        ModelRates::new(Some(1.0), Some(5.0), Some(0.0015)),
    );
    table.insert(
        "gemini-1.5-pro".to_string(),
        ModelRates::new(Some(1.25), Some(5.0), Some(0.0015)),
    );
    // Efficiency tiers
    table.insert(
        "gemini-2.5-flash".to_string(),
        ModelRates::new(Some(0.30), Some(2.50), Some(0.0015)),
    );
    table.insert(
        "gemini-2.5-flash-lite".to_string(),
        ModelRates::new(Some(0.10), Some(0.40), Some(0.0015)),
    );
    table.insert(
        "gemini-2.0-flash".to_string(),
        ModelRates::new(Some(0.10), Some(0.40), Some(0.0015)),
    );
    table.insert(
        "gemini-1.5-flash".to_string(),
        ModelRates::new(Some(0.075), Some(0.30), Some(0.0015)),
    );
    // Fallback default
    table.insert(
        "default".to_string(),
        ModelRates::new(Some(0.30), Some(2.50), Some(0.0015)),
    );
    table
}

pub fn load() -> Result<Settings, AppConfigError> {
    let default_storage = default_storage_path()?;
    let builder = Config::builder()
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

    let mut settings: Settings = builder.build()?.try_deserialize()?;
    if settings.storage.path.as_os_str().is_empty() {
        settings.storage.path = default_storage;
    }

    apply_secret_files(&mut settings)?;
    settings.price_overrides = detect_price_overrides(&mut settings)?;
    validate(&settings)?;
    Ok(settings)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "quaestor", "quaestor").ok_or(AppConfigError::MissingProjectDirs)
}

fn default_storage_path() -> Result<PathBuf, AppConfigError> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// Read a `{NAME}_FILE` secret path if set, returning the trimmed contents.
fn secret_file(name: &str) -> Result<Option<String>, AppConfigError> {
    let var = format!("{name}_FILE");
    let Some(path) = std::env::var_os(&var) else {
        return Ok(None);
    };
    let path = PathBuf::from(path);
    let content =
        std::fs::read_to_string(&path).map_err(|source| AppConfigError::SecretFile {
            name: name.to_string(),
            path,
            source,
        })?;
    Ok(Some(content.trim().to_string()))
}

fn apply_secret_files(settings: &mut Settings) -> Result<(), AppConfigError> {
    if let Some(key) = secret_file("QUAESTOR__GEMINI__API_KEY")? {
        settings.gemini.api_key = Some(key);
    }
    Ok(())
}

/// An explicit override exists when the env var itself is present OR its
/// `_FILE` sibling is; a `_FILE` sibling also supplies the value.
fn detect_price_overrides(settings: &mut Settings) -> Result<PriceOverrides, AppConfigError> {
    let mut overrides = PriceOverrides::default();

    let fields: [(&str, &mut f64, &mut bool); 3] = [
        (
            "QUAESTOR__PRICING__PRICE_PER_MTOK_INPUT",
            &mut settings.pricing.price_per_mtok_input,
            &mut overrides.input,
        ),
        (
            "QUAESTOR__PRICING__PRICE_PER_MTOK_OUTPUT",
            &mut settings.pricing.price_per_mtok_output,
            &mut overrides.output,
        ),
        (
            "QUAESTOR__PRICING__PRICE_PER_MTOK_INDEX",
            &mut settings.pricing.price_per_mtok_index,
            &mut overrides.index,
        ),
    ];

    for (name, value, flag) in fields {
        if std::env::var_os(name).is_some() {
            // The Environment source already deserialized the value.
            *flag = true;
            continue;
        }
        if let Some(raw) = secret_file(name)? {
            let parsed = raw
                .parse::<f64>()
                .map_err(|_| AppConfigError::SecretNotNumeric {
                    name: name.to_string(),
                    value: raw,
                })?;
            *value = parsed;
            *flag = true;
        }
    }

    Ok(overrides)
}

fn validate(settings: &Settings) -> Result<(), AppConfigError> {
    if settings.server.listen_addr.trim().is_empty() {
        return Err(AppConfigError::Invalid(
            "server.listen_addr may not be empty".to_string(),
        ));
    }
    let default_rates = settings
        .pricing
        .model_pricing
        .get("default")
        .ok_or_else(|| {
            AppConfigError::Invalid("model_pricing must include a `default` entry".to_string())
        })?;
    for (name, value) in [
        ("input_price", default_rates.input_price),
        ("output_price", default_rates.output_price),
    ] {
        if value.unwrap_or(0.0) <= 0.0 {
            return Err(AppConfigError::Invalid(format!(
                "model_pricing.default.{name} must be > 0"
            )));
        }
    }
    if !settings.gemini.mock_mode && settings.gemini.api_key.is_none() {
        return Err(AppConfigError::Invalid(
            "gemini.api_key must be set when gemini.mock_mode is false".to_string(),
        ));
    }
    if settings.chat.allow_metadata_filters && settings.chat.metadata_filter_allowed_keys.is_empty()
    {
        return Err(AppConfigError::Invalid(
            "chat.metadata_filter_allowed_keys must be set when metadata filters are enabled"
                .to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pricing_has_default_entry() {
        let table = default_model_pricing();
        let default = table.get("default").expect("default entry present");
        assert!(default.input_price.unwrap() > 0.0);
        assert!(default.output_price.unwrap() > 0.0);
        assert!(default.index_price.unwrap() > 0.0);
    }

    #[test]
    fn default_settings_validate() {
        let settings = Settings::default();
        validate(&settings).expect("defaults are valid");
    }

    #[test]
    fn metadata_filters_require_allowed_keys() {
        let mut settings = Settings::default();
        settings.chat.allow_metadata_filters = true;
        assert!(validate(&settings).is_err());
        settings
            .chat
            .metadata_filter_allowed_keys
            .push("category".to_string());
        assert!(validate(&settings).is_ok());
    }
}
