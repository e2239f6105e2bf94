// SPDX-License-Identifier: MIT OR Apache-2.0
//! awcp-config
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Runtime configuration for both AWCP engines: admission bounds,
//! delegation defaults, executor admission, and lifecycle switches.
//! Loaded from TOML, merged over defaults, validated with advisory
//! warnings.

use awcp_core::{AccessMode, SnapshotPolicy};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while loading or parsing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory issues that do not prevent operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A limit is zero, which refuses every delegation.
    ZeroLimit {
        /// Name of the offending field.
        field: String,
    },
    /// A TTL or retention value is unusually large.
    LargeValue {
        /// Name of the offending field.
        field: String,
        /// The configured value.
        value: u64,
    },
    /// The executor accepts no access mode at all.
    NoAccessModes,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::ZeroLimit { field } => {
                write!(f, "'{field}' is 0 — every delegation will be refused")
            }
            ConfigWarning::LargeValue { field, value } => {
                write!(f, "'{field}' is unusually large ({value})")
            }
            ConfigWarning::NoAccessModes => {
                write!(f, "'allowed_access_modes' is empty — every INVITE will be declined")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

const MIB: u64 = 1024 * 1024;

/// Pre-flight admission bounds (Delegator side).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct AdmissionLimits {
    /// Maximum total bytes shipped per delegation.
    pub max_total_bytes: u64,
    /// Maximum number of files shipped per delegation.
    pub max_file_count: u64,
    /// Maximum size of any single file.
    pub max_single_file_bytes: u64,
    /// Glob patterns for paths that must never leave the Delegator.
    pub sensitive_patterns: Vec<String>,
    /// Disable the sensitive-path check entirely.
    pub skip_sensitive_check: bool,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_total_bytes: 100 * MIB,
            max_file_count: 10_000,
            max_single_file_bytes: 50 * MIB,
            sensitive_patterns: awcp_glob::DEFAULT_SENSITIVE_PATTERNS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            skip_sensitive_check: false,
        }
    }
}

/// Per-delegation defaults (Delegator side).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct DelegationDefaults {
    /// Default lease lifetime in seconds.
    pub ttl_seconds: u64,
    /// Default requested access mode.
    pub access_mode: AccessMode,
    /// Default snapshot policy.
    pub snapshot_mode: SnapshotPolicy,
    /// How long staged snapshot payloads and terminal records are retained.
    pub snapshot_retention_ms: u64,
    /// Maximum snapshots accepted per delegation; extras are ignored.
    pub max_snapshots: usize,
    /// Per-request timeout for outbound HTTP calls, in milliseconds.
    pub request_timeout_ms: u64,
    /// SSE reconnect attempts before surfacing `SSE_FAILED`.
    pub sse_max_retries: u32,
    /// Linear backoff unit: attempt `n` waits `n * this` milliseconds.
    pub sse_retry_delay_ms: u64,
}

impl Default for DelegationDefaults {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            access_mode: AccessMode::Rw,
            snapshot_mode: SnapshotPolicy::Auto,
            snapshot_retention_ms: 30 * 60 * 1000,
            max_snapshots: 10,
            request_timeout_ms: 30_000,
            sse_max_retries: 3,
            sse_retry_delay_ms: 2000,
        }
    }
}

/// Executor-side admission gates and retention.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Hard cap on concurrent delegations; the next INVITE is declined.
    pub max_concurrent_delegations: usize,
    /// TTL ceiling; requested TTLs are clamped down to this.
    pub max_ttl_seconds: u64,
    /// Access modes this executor will grant.
    pub allowed_access_modes: Vec<AccessMode>,
    /// Accept admissible INVITEs without consulting a hook.
    pub auto_accept: bool,
    /// How long completed results are retained for SSE replay and recovery.
    pub result_retention_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_delegations: 5,
            max_ttl_seconds: 3600,
            allowed_access_modes: vec![AccessMode::Ro, AccessMode::Rw],
            auto_accept: true,
            result_retention_ms: 30 * 60 * 1000,
        }
    }
}

/// Startup and shutdown behavior, both sides.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Release every active delegation on shutdown.
    pub cleanup_on_shutdown: bool,
    /// Sweep stale work/snapshot directories at startup.
    pub cleanup_stale_on_startup: bool,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            cleanup_on_shutdown: true,
            cleanup_stale_on_startup: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

/// Top-level AWCP runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct AwcpConfig {
    /// Pre-flight admission bounds.
    pub admission: AdmissionLimits,
    /// Delegation defaults.
    pub delegation: DelegationDefaults,
    /// Executor admission and retention.
    pub executor: ExecutorSettings,
    /// Startup/shutdown switches.
    pub lifecycle: LifecycleSettings,
}

impl AwcpConfig {
    /// Load from a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileNotFound`] if the path does not exist,
    /// [`ConfigError::ParseError`] on invalid TOML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })
    }

    /// Load from a file when given, defaults otherwise.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::load`] errors for an explicit path.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Semantic validation; returns advisory warnings.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.admission.max_total_bytes == 0 {
            warnings.push(ConfigWarning::ZeroLimit {
                field: "admission.max_total_bytes".into(),
            });
        }
        if self.admission.max_file_count == 0 {
            warnings.push(ConfigWarning::ZeroLimit {
                field: "admission.max_file_count".into(),
            });
        }
        if self.executor.max_concurrent_delegations == 0 {
            warnings.push(ConfigWarning::ZeroLimit {
                field: "executor.max_concurrent_delegations".into(),
            });
        }
        if self.executor.allowed_access_modes.is_empty() {
            warnings.push(ConfigWarning::NoAccessModes);
        }
        // A day-plus lease usually means someone confused seconds and ms.
        for (field, value) in [
            ("delegation.ttl_seconds", self.delegation.ttl_seconds),
            ("executor.max_ttl_seconds", self.executor.max_ttl_seconds),
        ] {
            if value > 86_400 {
                warnings.push(ConfigWarning::LargeValue {
                    field: field.into(),
                    value,
                });
            }
        }

        warnings
    }
}
