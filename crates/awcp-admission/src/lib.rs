// SPDX-License-Identifier: MIT OR Apache-2.0
//! awcp-admission
#![deny(unsafe_code)]
//!
//! Pre-flight admission: before an INVITE leaves the Delegator, every
//! resource source is walked with the same selection rules the transport
//! will use, sizes are totalled against configured bounds, and path names
//! are screened against the sensitive-pattern list.
//!
//! A refusal here allocates nothing: admission runs before
//! materialization, so there is never a half-built export to roll back.

use awcp_core::{AdmissionReport, ErrorCode, ProtocolError, Resource};
use awcp_glob::{is_skipped_dir, SelectionRules, SensitiveMatcher};
use std::path::PathBuf;
use tracing::debug;
use walkdir::WalkDir;

/// Which admission bound a workspace exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceededBound {
    /// `max_total_bytes`.
    TotalBytes,
    /// `max_file_count`.
    FileCount,
    /// `max_single_file_bytes`.
    SingleFileBytes,
}

impl ExceededBound {
    fn field(self) -> &'static str {
        match self {
            Self::TotalBytes => "maxTotalBytes",
            Self::FileCount => "maxFileCount",
            Self::SingleFileBytes => "maxSingleFileBytes",
        }
    }
}

/// Errors raised by the admission scan.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// A configured bound was exceeded.
    #[error("workspace too large: {bound:?} ({observed} > {limit})")]
    TooLarge {
        /// Which bound.
        bound: ExceededBound,
        /// Observed value.
        observed: u64,
        /// Configured limit.
        limit: u64,
        /// Measurements gathered before the bound tripped.
        report: AdmissionReport,
    },

    /// A path matched the sensitive-pattern list.
    #[error("sensitive path in resource {resource}: {path}")]
    SensitivePath {
        /// Resource the path belongs to.
        resource: String,
        /// Relative path that matched.
        path: PathBuf,
        /// The matching pattern.
        pattern: String,
    },

    /// A resource source is missing or unreadable.
    #[error("resource {resource}: source unreadable: {path}")]
    SourceUnreadable {
        /// Resource name.
        resource: String,
        /// The source path.
        path: PathBuf,
    },

    /// A resource's glob rules failed to compile.
    #[error("resource {resource}: {reason}")]
    InvalidRules {
        /// Resource name.
        resource: String,
        /// Compile failure detail.
        reason: String,
    },
}

impl AdmissionError {
    /// Convert to the wire-level typed error.
    ///
    /// Bound violations map to `WORKSPACE_TOO_LARGE` with the violated
    /// bound in the hint; everything else is a `DECLINED` refusal.
    #[must_use]
    pub fn to_protocol_error(&self) -> ProtocolError {
        match self {
            Self::TooLarge {
                bound,
                observed,
                limit,
                ..
            } => ProtocolError::new(ErrorCode::WorkspaceTooLarge, "workspace exceeds admission bounds")
                .with_hint(format!("{} exceeded: {observed} > {limit}", bound.field())),
            Self::SensitivePath { path, pattern, .. } => {
                ProtocolError::declined("workspace contains sensitive paths")
                    .with_hint(format!("{} matches {pattern}", path.display()))
            }
            other => ProtocolError::declined(other.to_string()),
        }
    }
}

/// Configured admission bounds plus the sensitive matcher.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    /// Maximum total bytes shipped.
    pub max_total_bytes: u64,
    /// Maximum number of files shipped.
    pub max_file_count: u64,
    /// Maximum size of any single file.
    pub max_single_file_bytes: u64,
    /// Sensitive-path matcher.
    pub sensitive: SensitiveMatcher,
    /// Disable the sensitive-path check.
    pub skip_sensitive_check: bool,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        const MIB: u64 = 1024 * 1024;
        Self {
            max_total_bytes: 100 * MIB,
            max_file_count: 10_000,
            max_single_file_bytes: 50 * MIB,
            sensitive: SensitiveMatcher::default_set(),
            skip_sensitive_check: false,
        }
    }
}

/// Walk every resource source and admit or refuse the delegation.
///
/// The scan applies each resource's selection rules and the conventional
/// skip-directory list, so the measured set is exactly the set the
/// transport would ship.
///
/// # Errors
///
/// See [`AdmissionError`]; the first violation wins.
pub fn scan(
    resources: &[Resource],
    policy: &AdmissionPolicy,
) -> Result<AdmissionReport, AdmissionError> {
    let mut report = AdmissionReport::default();

    for resource in resources {
        let rules = SelectionRules::compile(&resource.include, &resource.exclude).map_err(
            |e| AdmissionError::InvalidRules {
                resource: resource.name.clone(),
                reason: e.to_string(),
            },
        )?;
        let source = PathBuf::from(&resource.source);
        if !source.is_dir() {
            return Err(AdmissionError::SourceUnreadable {
                resource: resource.name.clone(),
                path: source,
            });
        }

        let walker = WalkDir::new(&source)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                !(e.file_type().is_dir()
                    && e.file_name().to_str().is_some_and(is_skipped_dir))
            });

        for entry in walker {
            let entry = entry.map_err(|_| AdmissionError::SourceUnreadable {
                resource: resource.name.clone(),
                path: source.clone(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&source).unwrap_or(entry.path());
            if !rules.decide(rel).is_selected() {
                continue;
            }

            if !policy.skip_sensitive_check {
                if let Some(pattern) = policy.sensitive.first_match(rel) {
                    return Err(AdmissionError::SensitivePath {
                        resource: resource.name.clone(),
                        path: rel.to_path_buf(),
                        pattern: pattern.to_string(),
                    });
                }
            }

            let len = entry
                .metadata()
                .map(|m| m.len())
                .map_err(|_| AdmissionError::SourceUnreadable {
                    resource: resource.name.clone(),
                    path: entry.path().to_path_buf(),
                })?;

            report.file_count += 1;
            report.total_bytes += len;
            report.largest_file_bytes = report.largest_file_bytes.max(len);

            if len > policy.max_single_file_bytes {
                return Err(AdmissionError::TooLarge {
                    bound: ExceededBound::SingleFileBytes,
                    observed: len,
                    limit: policy.max_single_file_bytes,
                    report,
                });
            }
            if report.total_bytes > policy.max_total_bytes {
                return Err(AdmissionError::TooLarge {
                    bound: ExceededBound::TotalBytes,
                    observed: report.total_bytes,
                    limit: policy.max_total_bytes,
                    report,
                });
            }
            if report.file_count > policy.max_file_count {
                return Err(AdmissionError::TooLarge {
                    bound: ExceededBound::FileCount,
                    observed: report.file_count,
                    limit: policy.max_file_count,
                    report,
                });
            }
        }
    }

    debug!(
        target: "awcp.admission",
        total_bytes = report.total_bytes,
        file_count = report.file_count,
        largest = report.largest_file_bytes,
        "admission scan passed"
    );
    Ok(report)
}
