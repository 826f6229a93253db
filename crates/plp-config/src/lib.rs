//! Configuration file support (`plp.toml`).
//!
//! Every section is optional and defaulted. CLI flags are merged on top via
//! [`CliOverrides`] and [`PlpConfig::build_runtime_options`]; the carrier
//! and host tokens can also come from the environment so they stay out of
//! the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use plp_types::Party;
use serde::{Deserialize, Serialize};

/// Config file name looked up in a directory.
pub const CONFIG_FILE: &str = "plp.toml";

/// Environment variable overriding `carrier.token`.
pub const CARRIER_TOKEN_ENV: &str = "PLP_CARRIER_TOKEN";

/// Environment variable overriding `host.token`.
pub const HOST_TOKEN_ENV: &str = "PLP_HOST_TOKEN";

/// `humantime` strings ("30s", "1h") for `Duration` fields.
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

/// Engine behavior
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Refuse to run a stage on a batch whose status is not the stage's
    /// precondition (default: warn and continue)
    #[serde(default)]
    pub strict_validation: bool,
}

/// Batch lease configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Leases older than this are considered stale
    #[serde(with = "duration_str", default = "default_lock_timeout")]
    pub timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: default_lock_timeout(),
        }
    }
}

/// Carrier API settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Per-request HTTP timeout
    #[serde(with = "duration_str", default = "default_http_timeout")]
    pub timeout: Duration,
    /// Carrier service every declaration is posted under
    #[serde(default = "default_service_code")]
    pub service_code: String,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            token: None,
            timeout: default_http_timeout(),
            service_code: default_service_code(),
        }
    }
}

/// Host system API settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(with = "duration_str", default = "default_http_timeout")]
    pub timeout: Duration,
    /// Notify customers when their shipment is registered
    #[serde(default = "default_true")]
    pub notify_customer: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            token: None,
            timeout: default_http_timeout(),
            notify_customer: true,
        }
    }
}

/// Declaration defaults applied during data collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Used when an order has no weight, and as a floor otherwise
    #[serde(default = "default_min_weight")]
    pub min_weight_grams: u32,
    /// Declare the order's item value to the carrier
    #[serde(default)]
    pub declare_value: bool,
    #[serde(default)]
    pub receipt_notice: bool,
    #[serde(default)]
    pub own_hands: bool,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            min_weight_grams: default_min_weight(),
            declare_value: false,
            receipt_notice: false,
            own_hands: false,
        }
    }
}

/// A weight-tier package profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRule {
    pub name: String,
    /// Heaviest declared weight this package takes
    pub max_weight_grams: u32,
    pub height_cm: u32,
    pub width_cm: u32,
    pub length_cm: u32,
}

impl PackageRule {
    fn new(name: &str, max_weight_grams: u32, dims: (u32, u32, u32)) -> Self {
        Self {
            name: name.to_string(),
            max_weight_grams,
            height_cm: dims.0,
            width_cm: dims.1,
            length_cm: dims.2,
        }
    }
}

/// Contents of `plp.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlpConfig {
    /// Store, leases, labels and events live beneath this directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub carrier: CarrierConfig,

    #[serde(default)]
    pub host: HostConfig,

    /// Party printed as the sender on every declaration
    #[serde(default)]
    pub sender: Party,

    #[serde(default)]
    pub collection: CollectionConfig,

    #[serde(default = "default_packages")]
    pub packages: Vec<PackageRule>,
}

impl Default for PlpConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            engine: EngineConfig::default(),
            lock: LockConfig::default(),
            carrier: CarrierConfig::default(),
            host: HostConfig::default(),
            sender: Party::default(),
            collection: CollectionConfig::default(),
            packages: default_packages(),
        }
    }
}

/// CLI overrides for merging with config file values.
///
/// `Option` fields mean "flag not passed" when `None`; `bool` fields mean
/// "explicitly enabled" when `true`.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub state_dir: Option<PathBuf>,
    pub lock_timeout: Option<Duration>,
    pub strict_validation: bool,
    pub carrier_api_base: Option<String>,
    pub carrier_token: Option<String>,
    pub host_api_base: Option<String>,
    pub no_notify: bool,
}

/// Effective settings for one invocation.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub state_dir: PathBuf,
    pub lock_timeout: Duration,
    pub strict_validation: bool,
    pub carrier: CarrierConfig,
    pub host: HostConfig,
    pub sender: Party,
    pub collection: CollectionConfig,
    /// Sorted ascending by `max_weight_grams`
    pub packages: Vec<PackageRule>,
}

impl RuntimeOptions {
    pub fn store_dir(&self) -> PathBuf {
        self.state_dir.join("store")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn labels_dir(&self) -> PathBuf {
        self.state_dir.join("labels")
    }
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        PlpConfig::default().build_runtime_options(CliOverrides::default())
    }
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_service_code() -> String {
    "03298".to_string()
}

fn default_min_weight() -> u32 {
    300
}

fn default_true() -> bool {
    true
}

fn default_packages() -> Vec<PackageRule> {
    vec![
        PackageRule::new("envelope", 300, (2, 11, 16)),
        PackageRule::new("small", 1000, (8, 12, 20)),
        PackageRule::new("medium", 5000, (15, 20, 30)),
        PackageRule::new("large", 30000, (30, 40, 50)),
    ]
}

impl PlpConfig {
    /// Load `plp.toml` from `dir`. Returns `Ok(None)` if there is none.
    pub fn load_from_dir(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from_file(&path).map(Some)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock.timeout.is_zero() {
            bail!("lock.timeout must be greater than 0");
        }

        if self.carrier.timeout.is_zero() {
            bail!("carrier.timeout must be greater than 0");
        }
        if self.host.timeout.is_zero() {
            bail!("host.timeout must be greater than 0");
        }
        if matches!(self.carrier.api_base.as_deref(), Some(base) if base.trim().is_empty()) {
            bail!("carrier.api_base cannot be empty");
        }
        if matches!(self.host.api_base.as_deref(), Some(base) if base.trim().is_empty()) {
            bail!("host.api_base cannot be empty");
        }
        if self.carrier.service_code.trim().is_empty() {
            bail!("carrier.service_code cannot be empty");
        }

        if self.collection.min_weight_grams == 0 {
            bail!("collection.min_weight_grams must be greater than 0");
        }

        if self.packages.is_empty() {
            bail!("at least one [[packages]] rule is required");
        }
        for rule in &self.packages {
            if rule.name.trim().is_empty() {
                bail!("packages[].name cannot be empty");
            }
            if rule.max_weight_grams == 0 {
                bail!("package {}: max_weight_grams must be greater than 0", rule.name);
            }
            if rule.height_cm == 0 || rule.width_cm == 0 || rule.length_cm == 0 {
                bail!("package {}: dimensions must be greater than 0", rule.name);
            }
        }

        Ok(())
    }

    /// Merge CLI overrides and environment tokens over file values.
    ///
    /// Precedence for tokens: CLI flag, then environment, then file.
    pub fn build_runtime_options(&self, cli: CliOverrides) -> RuntimeOptions {
        let mut carrier = self.carrier.clone();
        if let Some(base) = cli.carrier_api_base {
            carrier.api_base = Some(base);
        }
        carrier.token = cli
            .carrier_token
            .or_else(|| env_token(CARRIER_TOKEN_ENV))
            .or(carrier.token);

        let mut host = self.host.clone();
        if let Some(base) = cli.host_api_base {
            host.api_base = Some(base);
        }
        host.token = env_token(HOST_TOKEN_ENV).or(host.token);
        if cli.no_notify {
            host.notify_customer = false;
        }

        let mut packages = self.packages.clone();
        packages.sort_by_key(|rule| rule.max_weight_grams);

        RuntimeOptions {
            state_dir: cli.state_dir.unwrap_or_else(|| {
                self.state_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(".plp"))
            }),
            lock_timeout: cli.lock_timeout.unwrap_or(self.lock.timeout),
            strict_validation: cli.strict_validation || self.engine.strict_validation,
            carrier,
            host,
            sender: self.sender.clone(),
            collection: self.collection.clone(),
            packages,
        }
    }

    /// Starter `plp.toml` with every setting and its default.
    pub fn default_toml_template() -> String {
        r#"# PLP configuration file

# Where the batch store, leases, labels and event log are kept
# state_dir = ".plp"

[engine]
# Refuse to run a stage on a batch in the wrong status (default: warn and continue)
strict_validation = false

[lock]
# Batch leases older than this are considered stale
timeout = "1h"

[carrier]
# api_base = "https://carrier.example.com/api"
# token = "..."            # or set PLP_CARRIER_TOKEN
timeout = "30s"
service_code = "03298"

[host]
# api_base = "https://shop.example.com/api"
# token = "..."            # or set PLP_HOST_TOKEN
timeout = "30s"
notify_customer = true

[sender]
name = ""
# document = ""
# phone = ""
# email = ""

[sender.address]
street = ""
number = ""
district = ""
city = ""
state = ""
postal_code = ""
country = "BR"

[collection]
# Fallback (and floor) declared weight
min_weight_grams = 300
declare_value = false
receipt_notice = false
own_hands = false

# Package profiles, matched by declared weight (lightest fitting rule wins)
[[packages]]
name = "envelope"
max_weight_grams = 300
height_cm = 2
width_cm = 11
length_cm = 16

[[packages]]
name = "small"
max_weight_grams = 1000
height_cm = 8
width_cm = 12
length_cm = 20

[[packages]]
name = "medium"
max_weight_grams = 5000
height_cm = 15
width_cm = 20
length_cm = 30

[[packages]]
name = "large"
max_weight_grams = 30000
height_cm = 30
width_cm = 40
length_cm = 50
"#
        .to_string()
    }
}

fn env_token(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}
