//! Test configuration: TOML file + env var overrides + test-level task overrides.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, SmokeError};
use crate::model::runtime::AssertionKind;
use crate::stream::client::{ReaderType, StreamPolicies};

/// One load test: tasks to hand out, assertions to evaluate, and the
/// coordinator's own tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestConfiguration {
    /// Derived from the file content when a file leaves it out.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub minutes: u64,
    pub forever: bool,
    /// Assertion key to threshold. Only configured assertions run.
    pub assertions: BTreeMap<String, i64>,

    /// Create streams and reader groups before the test starts.
    pub create_stream: bool,
    /// Delete streams once the test ends.
    pub delete_stream: bool,

    // Overrides pushed into every task by `apply_global_options`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transactional: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ThrottleConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<PayloadConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_policies: Option<StreamPolicies>,

    pub tasks: Vec<TaskConfiguration>,
    pub coordinator: CoordinatorConfig,
    pub paths: PathsConfig,
}

/// Work assigned to one worker process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskConfiguration {
    pub num_readers: u32,
    pub num_forgetful_readers: u32,
    /// Minutes between resets of a forgetful reader's group.
    pub attention_span_minutes: u64,
    pub num_writers: u32,
    pub reader_type: ReaderType,

    pub transactional: bool,
    pub transaction_size: u32,
    pub scope: String,
    pub stream: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_policies: Option<StreamPolicies>,
    pub payload: PayloadConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reader_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ThrottleConfig>,

    pub forever: bool,
    pub minutes: u64,
    pub duplicates: u32,
}

/// Rate limits applied inside writer loops. Absent fields are disabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ThrottleConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_events_per_second: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_outstanding_acks: Option<u32>,
    /// Period of the sine-wave modulation of `max_events_per_second`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic_throttle_period_minutes: Option<u32>,
}

impl ThrottleConfig {
    /// A single outstanding ack means every write waits for its ack.
    #[must_use]
    pub fn is_wait_for_ack(&self) -> bool {
        self.max_outstanding_acks == Some(1)
    }
}

/// Shape of generated events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PayloadConfig {
    pub minimum_size: usize,
    /// Defaults to `minimum_size`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_size: Option<usize>,
    pub number_of_keys: usize,
    /// Pick routing keys around a hot key that moves every ten minutes.
    pub dynamic_key_probability: bool,
}

impl PayloadConfig {
    #[must_use]
    pub fn effective_maximum_size(&self) -> usize {
        self.maximum_size.unwrap_or(self.minimum_size)
    }
}

/// Coordinator and worker cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub report_interval_secs: u64,
    /// Added to the report interval to get the watchdog silence limit.
    pub watchdog_grace_secs: u64,
    pub read_timeout_ms: u64,
    pub ready_poll_interval_ms: u64,
    pub controller_uri: String,
}

/// Filesystem paths used by the harness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub activity_log: PathBuf,
}

impl Default for TestConfiguration {
    fn default() -> Self {
        let id = generate_id();
        Self {
            name: format!("Stream Test - {id}"),
            id,
            minutes: 1,
            forever: false,
            assertions: BTreeMap::new(),
            create_stream: true,
            delete_stream: true,
            scope: None,
            stream: None,
            transactional: None,
            transaction_size: None,
            throttle: None,
            payload: None,
            stream_policies: None,
            tasks: Vec::new(),
            coordinator: CoordinatorConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for TaskConfiguration {
    fn default() -> Self {
        Self {
            num_readers: 0,
            num_forgetful_readers: 0,
            attention_span_minutes: 12 * 60,
            num_writers: 0,
            reader_type: ReaderType::Tail,
            transactional: false,
            transaction_size: 10,
            scope: String::new(),
            stream: String::new(),
            stream_policies: None,
            payload: PayloadConfig::default(),
            reader_group: None,
            throttle: None,
            forever: false,
            minutes: 1,
            duplicates: 1,
        }
    }
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            minimum_size: 100,
            maximum_size: None,
            number_of_keys: 100,
            dynamic_key_probability: false,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 30,
            watchdog_grace_secs: 120,
            read_timeout_ms: 1_000,
            ready_poll_interval_ms: 2_000,
            controller_uri: "tcp://127.0.0.1:9090".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from("smoketest.toml"),
            activity_log: env::temp_dir().join("smoketest").join("activity.jsonl"),
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    /// Silence after which the coordinator merges without a fresh report.
    #[must_use]
    pub fn watchdog_silence(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs + self.watchdog_grace_secs)
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    #[must_use]
    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }
}

impl TaskConfiguration {
    /// `scope/stream`, the key streams are grouped and reported under.
    #[must_use]
    pub fn stream_fqn(&self) -> String {
        format!("{}/{}", self.scope, self.stream)
    }

    /// Configured reader group, or one derived from scope and stream.
    #[must_use]
    pub fn reader_group_name(&self) -> String {
        self.reader_group
            .clone()
            .unwrap_or_else(|| default_reader_group_name(&self.scope, &self.stream))
    }

    /// Loop budget; `None` runs until stopped.
    #[must_use]
    pub fn runtime(&self) -> Option<Duration> {
        (!self.forever).then(|| Duration::from_secs(self.minutes * 60))
    }

    #[must_use]
    pub fn total_readers(&self) -> u32 {
        self.num_readers + self.num_forgetful_readers
    }
}

/// `Scope` + `Stream` with each part capitalized.
#[must_use]
pub fn default_reader_group_name(scope: &str, stream: &str) -> String {
    format!("{}{}", capitalize(scope), capitalize(stream))
}

fn capitalize(raw: &str) -> String {
    let mut chars = raw.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

/// Random 32-hex-digit identifier.
#[must_use]
pub fn generate_id() -> String {
    let mut rng = rand::rng();
    format!("{:016x}{:016x}", rng.random::<u64>(), rng.random::<u64>())
}

impl TestConfiguration {
    /// Load from an explicit path, then apply env overrides, task overrides,
    /// and validation.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SmokeError::MissingConfig {
                path: path.to_path_buf(),
            });
        }
        let raw = fs::read_to_string(path).map_err(|source| SmokeError::io(path, source))?;
        let mut cfg: Self = toml::from_str(&raw)?;
        cfg.assign_identity()?;
        cfg.paths.config_file = path.to_path_buf();
        cfg.apply_env_overrides_from(env_var)?;
        cfg.apply_global_options();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse TOML text without consulting the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut cfg: Self = toml::from_str(raw)?;
        cfg.assign_identity()?;
        cfg.apply_global_options();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loading the same file twice must give the same test, so a missing id
    /// comes from the content rather than from a random source.
    fn assign_identity(&mut self) -> Result<()> {
        if self.id.is_empty() {
            self.id = self.stable_hash()?;
        }
        if self.name.is_empty() {
            self.name = format!("Stream Test - {}", self.id);
        }
        Ok(())
    }

    /// Stable hash of the effective configuration for log lines.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("SMK_MINUTES") {
            self.minutes = parse_env_u64("SMK_MINUTES", &raw)?;
        }
        if let Some(raw) = lookup("SMK_FOREVER") {
            self.forever = parse_env_bool("SMK_FOREVER", &raw)?;
        }
        if let Some(raw) = lookup("SMK_CONTROLLER_URI") {
            self.coordinator.controller_uri = raw;
        }
        if let Some(raw) = lookup("SMK_REPORT_INTERVAL_SECS") {
            self.coordinator.report_interval_secs =
                parse_env_u64("SMK_REPORT_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = lookup("SMK_WATCHDOG_GRACE_SECS") {
            self.coordinator.watchdog_grace_secs = parse_env_u64("SMK_WATCHDOG_GRACE_SECS", &raw)?;
        }
        if let Some(raw) = lookup("SMK_READ_TIMEOUT_MS") {
            self.coordinator.read_timeout_ms = parse_env_u64("SMK_READ_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("SMK_ACTIVITY_LOG") {
            self.paths.activity_log = PathBuf::from(raw);
        }
        Ok(())
    }

    /// Push test-level settings into every task and expand duplicates.
    /// Running it twice is a no-op.
    pub fn apply_global_options(&mut self) {
        let mut expanded = Vec::with_capacity(self.tasks.len());
        for mut task in self.tasks.drain(..) {
            task.minutes = self.minutes;
            task.forever = self.forever;
            if let Some(transactional) = self.transactional {
                task.transactional = transactional;
            }
            if let Some(size) = self.transaction_size {
                task.transaction_size = size;
            }
            if let Some(scope) = &self.scope {
                task.scope.clone_from(scope);
            }
            if let Some(stream) = &self.stream {
                task.stream.clone_from(stream);
            }
            if let Some(policies) = &self.stream_policies {
                task.stream_policies = Some(policies.clone());
            }
            if let Some(throttle) = &self.throttle {
                task.throttle = Some(throttle.clone());
            }
            if let Some(payload) = &self.payload {
                task.payload = payload.clone();
            }
            let copies = task.duplicates.max(1);
            task.duplicates = 1;
            for _ in 0..copies {
                expanded.push(task.clone());
            }
        }
        self.tasks = expanded;
    }

    /// Tasks grouped by `scope/stream`.
    #[must_use]
    pub fn tasks_by_stream(&self) -> BTreeMap<String, Vec<&TaskConfiguration>> {
        let mut grouped: BTreeMap<String, Vec<&TaskConfiguration>> = BTreeMap::new();
        for task in &self.tasks {
            grouped.entry(task.stream_fqn()).or_default().push(task);
        }
        grouped
    }

    /// Tasks grouped by their (possibly derived) reader group.
    #[must_use]
    pub fn tasks_by_reader_group(&self) -> BTreeMap<String, Vec<&TaskConfiguration>> {
        let mut grouped: BTreeMap<String, Vec<&TaskConfiguration>> = BTreeMap::new();
        for task in &self.tasks {
            grouped
                .entry(task.reader_group_name())
                .or_default()
                .push(task);
        }
        grouped
    }

    /// Total test duration; `None` when running forever.
    #[must_use]
    pub fn runtime(&self) -> Option<Duration> {
        (!self.forever).then(|| Duration::from_secs(self.minutes * 60))
    }

    pub fn validate(&self) -> Result<()> {
        let unknown: Vec<&str> = self
            .assertions
            .keys()
            .filter(|key| AssertionKind::parse(key).is_none())
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            let valid: Vec<&str> = AssertionKind::ALL.iter().map(|k| k.as_str()).collect();
            return Err(SmokeError::InvalidConfig {
                details: format!(
                    "invalid assertion key(s) {unknown:?}; expected one of {valid:?}"
                ),
            });
        }

        if !self.forever && self.minutes == 0 {
            return Err(SmokeError::InvalidConfig {
                details: "minutes must be > 0 unless forever is set".to_string(),
            });
        }

        if self.tasks.is_empty() {
            return Err(SmokeError::InvalidConfig {
                details: "at least one task is required".to_string(),
            });
        }

        for (index, task) in self.tasks.iter().enumerate() {
            validate_task(index, task)?;
        }

        if self.coordinator.report_interval_secs == 0 {
            return Err(SmokeError::InvalidConfig {
                details: "coordinator.report_interval_secs must be > 0".to_string(),
            });
        }
        if self.coordinator.read_timeout_ms == 0 {
            return Err(SmokeError::InvalidConfig {
                details: "coordinator.read_timeout_ms must be > 0".to_string(),
            });
        }
        if self.coordinator.ready_poll_interval_ms == 0 {
            return Err(SmokeError::InvalidConfig {
                details: "coordinator.ready_poll_interval_ms must be > 0".to_string(),
            });
        }

        Ok(())
    }
}

fn validate_task(index: usize, task: &TaskConfiguration) -> Result<()> {
    let invalid = |details: String| SmokeError::InvalidConfig {
        details: format!("tasks[{index}]: {details}"),
    };

    if task.scope.trim().is_empty() || task.stream.trim().is_empty() {
        return Err(invalid("scope and stream must be set".to_string()));
    }
    if task.num_writers == 0 && task.total_readers() == 0 {
        return Err(invalid("task has neither writers nor readers".to_string()));
    }
    if task.transactional && task.transaction_size == 0 {
        return Err(invalid("transaction_size must be > 0".to_string()));
    }
    if task.num_forgetful_readers > 0 && task.attention_span_minutes == 0 {
        return Err(invalid("attention_span_minutes must be > 0".to_string()));
    }

    let payload = &task.payload;
    if payload.minimum_size == 0 {
        return Err(invalid("payload.minimum_size must be > 0".to_string()));
    }
    if payload.effective_maximum_size() < payload.minimum_size {
        return Err(invalid(format!(
            "payload.maximum_size ({}) must be >= minimum_size ({})",
            payload.effective_maximum_size(),
            payload.minimum_size
        )));
    }
    if payload.number_of_keys == 0 {
        return Err(invalid("payload.number_of_keys must be > 0".to_string()));
    }

    if let Some(throttle) = &task.throttle {
        for (name, value) in [
            ("max_events_per_second", throttle.max_events_per_second),
            ("max_outstanding_acks", throttle.max_outstanding_acks),
            (
                "dynamic_throttle_period_minutes",
                throttle.dynamic_throttle_period_minutes,
            ),
        ] {
            if value == Some(0) {
                return Err(invalid(format!("throttle.{name} must be > 0 when set")));
            }
        }
        if throttle.dynamic_throttle_period_minutes.is_some()
            && throttle.max_events_per_second.is_none()
        {
            return Err(invalid(
                "throttle.dynamic_throttle_period_minutes requires max_events_per_second"
                    .to_string(),
            ));
        }
    }

    Ok(())
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.parse::<u64>().map_err(|error| SmokeError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    raw.parse::<bool>().map_err(|error| SmokeError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}
