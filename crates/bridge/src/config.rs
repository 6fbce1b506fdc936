//! File-based configuration.
//!
//! ```yaml
//! entry: main
//! package: ./app.wasm
//! send-timeout: 5 secs
//! receive-timeout: 100 ms
//! ```

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    package::{Package, probe_entry_point},
    scope::{DEFAULT_OUTBOUND_CAPACITY, IsolationOptions},
};

const fn default_outbound_capacity() -> usize {
    DEFAULT_OUTBOUND_CAPACITY
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BridgeConfig {
    /// Name of the exported `() -> ()` function that boots the application.
    pub entry: String,
    /// Path to the `.wasm` package.
    pub package: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_budget: Option<String>,
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<PathBuf>,
}

impl BridgeConfig {
    pub fn new(entry: impl Into<String>, package: impl Into<PathBuf>) -> Self {
        Self {
            entry: entry.into(),
            package: package.into(),
            send_timeout: None,
            receive_timeout: None,
            call_budget: None,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_memory: None,
            cache: None,
        }
    }

    /// # Errors
    /// [`Error::Config`] if the document is not a valid configuration.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load a configuration file. Relative `package` and `cache` paths are
    /// taken relative to the directory holding the file.
    ///
    /// # Errors
    /// [`Error::Io`] if the file cannot be read, [`Error::Config`] if it does
    /// not parse.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::from_yaml_str(&std::fs::read_to_string(path)?)?;
        if let Some(base) = path.parent() {
            if config.package.is_relative() && !config.package.as_os_str().is_empty() {
                config.package = base.join(&config.package);
            }
            if let Some(cache) = config.cache.as_mut().filter(|cache| cache.is_relative()) {
                *cache = base.join(&*cache);
            }
        }
        Ok(config)
    }

    /// # Errors
    /// [`Error::Config`] on a malformed duration.
    pub fn send_timeout(&self) -> Result<Duration> {
        optional_duration(self.send_timeout.as_deref())
    }

    /// # Errors
    /// [`Error::Config`] on a malformed duration.
    pub fn receive_timeout(&self) -> Result<Duration> {
        optional_duration(self.receive_timeout.as_deref())
    }

    /// # Errors
    /// [`Error::Config`] on a malformed call budget or a zero capacity.
    pub fn isolation_options(&self) -> Result<IsolationOptions> {
        if self.outbound_capacity == 0 {
            return Err(Error::Config("outbound-capacity must be at least 1".to_string()));
        }
        let mut options = IsolationOptions::default().outbound_capacity(self.outbound_capacity);
        if let Some(budget) = self.call_budget.as_deref() {
            options = options.call_budget(parse_duration(budget)?);
        }
        if let Some(max_memory) = self.max_memory {
            options = options.max_memory(max_memory);
        }
        if let Some(cache) = &self.cache {
            options = options.cache(cache);
        }
        Ok(options)
    }

    /// Check that the configuration can start an application, without
    /// running any guest code.
    ///
    /// # Errors
    /// The first problem found: an empty entry or package, an invalid
    /// package, or an entry point the package does not export.
    pub fn validate(&self) -> Result<Package> {
        if self.entry.trim().is_empty() {
            return Err(Error::Config("'entry' must not be empty".to_string()));
        }
        if self.package.as_os_str().is_empty() {
            return Err(Error::Config("'package' must not be empty".to_string()));
        }
        self.send_timeout()?;
        self.receive_timeout()?;
        self.isolation_options()?;

        let package = Package::resolve(&self.package)?;
        probe_entry_point(&package, &self.entry)?;
        Ok(package)
    }
}

fn optional_duration(value: Option<&str>) -> Result<Duration> {
    value.map_or(Ok(Duration::ZERO), parse_duration)
}

/// Parse a duration such as `"5 secs"`, `"100ms"` or `"2 Hours"`.
///
/// # Errors
/// [`Error::Config`] if the value is not `<integer> <unit>` with a known unit.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (amount, unit) = trimmed.split_at(split);
    let invalid = || Error::Config(format!("'{value}' is not a valid time duration"));

    if amount.is_empty() {
        return Err(invalid());
    }
    let amount: u64 = amount.parse().map_err(|_| invalid())?;
    let unit = unit.trim().to_ascii_lowercase();

    let nanos_per_unit: u64 = match unit.as_str() {
        "ns" | "nano" | "nanos" | "nanosecond" | "nanoseconds" => 1,
        "ms" | "milli" | "millis" | "millisecond" | "milliseconds" => 1_000_000,
        "s" | "sec" | "secs" | "second" | "seconds" => 1_000_000_000,
        "m" | "min" | "mins" | "minute" | "minutes" => 60 * 1_000_000_000,
        "h" | "hr" | "hrs" | "hour" | "hours" => 60 * 60 * 1_000_000_000,
        "d" | "day" | "days" => 24 * 60 * 60 * 1_000_000_000,
        _ => return Err(invalid()),
    };

    amount
        .checked_mul(nanos_per_unit)
        .map(Duration::from_nanos)
        .ok_or_else(invalid)
}
