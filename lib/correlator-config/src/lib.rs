//! Runtime configuration store.
//!
//! This is the store modules, handlers, and sources consult at runtime for
//! their own typed options. It is distinct from the application topology
//! loader (the JSON file describing sources/engines/reactors) which lives in
//! the `correlator` binary crate.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use snafu::Snafu;

fn email_regex() -> &'static Regex {
    static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
    EMAIL_RE.get_or_init(|| {
        Regex::new(r"(?i)^[A-Z0-9+_.-]+@[A-Z0-9.-]+$").expect("valid email regex")
    })
}

/// The type a configuration item was registered with. `get` always returns a
/// value of this type; `set` is the only path that can change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigType {
    Integer,
    Float,
    String,
    Boolean,
    Bytes,
    Email,
}

impl ConfigType {
    pub fn name(self) -> &'static str {
        match self {
            ConfigType::Integer => "Integer",
            ConfigType::Float => "Float",
            ConfigType::String => "String",
            ConfigType::Boolean => "Boolean",
            ConfigType::Bytes => "Bytes",
            ConfigType::Email => "Email",
        }
    }
}

/// A coerced configuration value, as returned by [`ConfigStore::get`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Bytes(Vec<u8>),
    Email(String),
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) | ConfigValue::Email(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConfigValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(f) => Some(*f),
            ConfigValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ConfigValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    fn display(&self) -> String {
        match self {
            ConfigValue::Integer(i) => i.to_string(),
            ConfigValue::Float(f) => f.to_string(),
            ConfigValue::String(s) | ConfigValue::Email(s) => s.clone(),
            ConfigValue::Boolean(b) => b.to_string(),
            ConfigValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

/// A value handed to [`ConfigStore::set`] before coercion to the registered
/// [`ConfigType`]. CLI overrides and file-config values always arrive as
/// strings; module code may set typed values directly.
#[derive(Debug, Clone)]
pub enum RawValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl From<&str> for RawValue {
    fn from(v: &str) -> Self {
        RawValue::Str(v.to_string())
    }
}

impl From<String> for RawValue {
    fn from(v: String) -> Self {
        RawValue::Str(v)
    }
}

impl From<i64> for RawValue {
    fn from(v: i64) -> Self {
        RawValue::Int(v)
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Float(v)
    }
}

impl From<bool> for RawValue {
    fn from(v: bool) -> Self {
        RawValue::Bool(v)
    }
}

impl RawValue {
    fn as_lower_str(&self) -> Option<String> {
        match self {
            RawValue::Str(s) => Some(s.to_ascii_lowercase()),
            _ => None,
        }
    }
}

/// A configuration item as supplied by a caller to [`ConfigStore::register`],
/// before the store assigns it a fully-qualified key.
#[derive(Debug, Clone)]
pub struct ConfigItem {
    pub key: String,
    pub ty: ConfigType,
    pub default: ConfigValue,
    pub description: String,
}

struct StoredItem {
    ty: ConfigType,
    default: ConfigValue,
    description: String,
    value: Option<ConfigValue>,
}

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Unknown configuration parameter: {key}"))]
    UnknownKey { key: String },

    #[snafu(display("{key}: {message}"))]
    InvalidValue { key: String, message: String },
}

/// The typed, namespaced runtime configuration store (C1).
///
/// Keys are flat strings of the form `prefix[.instance].key`. `register`
/// populates the store with defaults; `set` is the only mutator and always
/// coerces to the item's registered type; `get` never returns an uncoerced
/// value.
#[derive(Default)]
pub struct ConfigStore {
    items: BTreeMap<String, StoredItem>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a batch of configuration items under `prefix[.instance]`.
    pub fn register(&mut self, items: &[ConfigItem], prefix: &str, instance: Option<&str>) {
        for item in items {
            let fq_key = match instance {
                Some(instance) => format!("{prefix}.{instance}.{}", item.key),
                None => format!("{prefix}.{}", item.key),
            };
            tracing::debug!(key = %item.key, fq_key = %fq_key, "configuration item registered");
            self.items.insert(
                fq_key,
                StoredItem {
                    ty: item.ty,
                    default: item.default.clone(),
                    description: item.description.clone(),
                    value: None,
                },
            );
        }
    }

    fn stored(&self, key: &str) -> Result<&StoredItem, ConfigError> {
        self.items.get(key).ok_or_else(|| {
            UnknownKeySnafu {
                key: key.to_string(),
            }
            .build()
        })
    }

    /// Coerces `raw` to the type `key` was registered with and stores it.
    pub fn set(&mut self, key: &str, raw: impl Into<RawValue>) -> Result<(), ConfigError> {
        let raw = raw.into();
        let ty = self.stored(key)?.ty;

        let coerced = match ty {
            ConfigType::Boolean => coerce_bool(key, &raw)?,
            ConfigType::Integer => coerce_integer(key, &raw)?,
            ConfigType::Float => coerce_float(key, &raw)?,
            ConfigType::Email => coerce_email(key, &raw)?,
            ConfigType::Bytes => coerce_bytes(&raw),
            ConfigType::String => coerce_string(&raw),
        };

        tracing::debug!(key, value = %coerced.display(), "configuration parameter set");

        self.items.get_mut(key).unwrap().value = Some(coerced);
        Ok(())
    }

    /// Returns the current value, falling back to the registered default.
    pub fn get(&self, key: &str) -> Result<ConfigValue, ConfigError> {
        let item = self.stored(key)?;
        Ok(item.value.clone().unwrap_or_else(|| item.default.clone()))
    }

    pub fn get_values(&self, keys: &[&str]) -> Result<Vec<ConfigValue>, ConfigError> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Enumerates `(key, description, default, current, type name)` for
    /// diagnostics and startup dumps.
    pub fn list(&self) -> Vec<(String, String, ConfigValue, ConfigValue, &'static str)> {
        self.items
            .iter()
            .map(|(key, item)| {
                let current = item.value.clone().unwrap_or_else(|| item.default.clone());
                (
                    key.clone(),
                    item.description.clone(),
                    item.default.clone(),
                    current,
                    item.ty.name(),
                )
            })
            .collect()
    }

    /// Logs the full parameter table at INFO, mirroring the source's
    /// `dump_to_log`.
    pub fn dump(&self) {
        tracing::info!(
            "{:<45} {:<10} {:<20} {:<20} {}",
            "Parameter",
            "Type",
            "Value",
            "Default",
            "Description"
        );
        for (key, desc, default, current, ty) in self.list() {
            tracing::info!(
                "{:<45} {:<10} {:<20} {:<20} {}",
                key,
                ty,
                current.display(),
                default.display(),
                desc
            );
        }
    }
}

fn coerce_bool(key: &str, raw: &RawValue) -> Result<ConfigValue, ConfigError> {
    if let Some(lower) = raw.as_lower_str() {
        return match lower.as_str() {
            "0" | "false" | "no" => Ok(ConfigValue::Boolean(false)),
            "1" | "true" | "yes" => Ok(ConfigValue::Boolean(true)),
            _ => InvalidValueSnafu {
                key: key.to_string(),
                message: format!("{lower} does not map to a valid boolean"),
            }
            .fail(),
        };
    }
    match raw {
        RawValue::Bool(b) => Ok(ConfigValue::Boolean(*b)),
        RawValue::Int(0) => Ok(ConfigValue::Boolean(false)),
        RawValue::Int(1) => Ok(ConfigValue::Boolean(true)),
        other => InvalidValueSnafu {
            key: key.to_string(),
            message: format!("{other:?} does not map to a valid boolean"),
        }
        .fail(),
    }
}

fn coerce_integer(key: &str, raw: &RawValue) -> Result<ConfigValue, ConfigError> {
    match raw {
        RawValue::Int(i) => Ok(ConfigValue::Integer(*i)),
        RawValue::Str(s) => s.parse::<i64>().map(ConfigValue::Integer).map_err(|_| {
            InvalidValueSnafu {
                key: key.to_string(),
                message: format!("{s} will not cast to a valid integer"),
            }
            .build()
        }),
        other => InvalidValueSnafu {
            key: key.to_string(),
            message: format!("{other:?} will not cast to a valid integer"),
        }
        .fail(),
    }
}

fn coerce_float(key: &str, raw: &RawValue) -> Result<ConfigValue, ConfigError> {
    match raw {
        RawValue::Float(f) => Ok(ConfigValue::Float(*f)),
        RawValue::Int(i) => Ok(ConfigValue::Float(*i as f64)),
        RawValue::Str(s) => s.parse::<f64>().map(ConfigValue::Float).map_err(|_| {
            InvalidValueSnafu {
                key: key.to_string(),
                message: format!("{s} will not cast to a valid float"),
            }
            .build()
        }),
        other => InvalidValueSnafu {
            key: key.to_string(),
            message: format!("{other:?} will not cast to a valid float"),
        }
        .fail(),
    }
}

fn coerce_email(key: &str, raw: &RawValue) -> Result<ConfigValue, ConfigError> {
    let s = match raw {
        RawValue::Str(s) => s.clone(),
        other => format!("{other:?}"),
    };
    if email_regex().is_match(&s) {
        Ok(ConfigValue::Email(s))
    } else {
        InvalidValueSnafu {
            key: key.to_string(),
            message: format!("{s} is not a valid email address"),
        }
        .fail()
    }
}

fn coerce_bytes(raw: &RawValue) -> ConfigValue {
    match raw {
        RawValue::Bytes(b) => ConfigValue::Bytes(b.clone()),
        RawValue::Str(s) => ConfigValue::Bytes(s.clone().into_bytes()),
        RawValue::Int(i) => ConfigValue::Bytes(i.to_string().into_bytes()),
        RawValue::Float(f) => ConfigValue::Bytes(f.to_string().into_bytes()),
        RawValue::Bool(b) => ConfigValue::Bytes(b.to_string().into_bytes()),
    }
}

fn coerce_string(raw: &RawValue) -> ConfigValue {
    match raw {
        RawValue::Str(s) => ConfigValue::String(s.clone()),
        RawValue::Int(i) => ConfigValue::String(i.to_string()),
        RawValue::Float(f) => ConfigValue::String(f.to_string()),
        RawValue::Bool(b) => ConfigValue::String(b.to_string()),
        RawValue::Bytes(b) => ConfigValue::String(String::from_utf8_lossy(b).into_owned()),
    }
}

/// The base system configuration block, registered once under `system.`,
/// mirroring `BaseSystemConfig` in the source implementation.
pub fn base_system_config() -> &'static [ConfigItem] {
    static ITEMS: OnceLock<Vec<ConfigItem>> = OnceLock::new();
    ITEMS.get_or_init(|| {
        vec![ConfigItem {
            key: "run_dir".to_string(),
            ty: ConfigType::String,
            default: ConfigValue::String("/var/spool/correlator".to_string()),
            description: "Writable folder for internal files".to_string(),
        }]
    })
}

/// Prefixes `system.run_dir` onto `file_name` unless it already has a path
/// component.
pub fn prefix_run_dir(store: &ConfigStore, file_name: &str) -> String {
    if file_name.contains('/') {
        return file_name.to_string();
    }
    let run_dir = store
        .get("system.run_dir")
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "/var/spool/correlator".to_string());
    format!("{run_dir}/{file_name}")
}
