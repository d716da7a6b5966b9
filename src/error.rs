//! Error types for the disk orchestration core
//!
//! Two error types: [`DiskError`] (the closed taxonomy the upstream RPC layer
//! is expected to match on) and [`ConfigError`] (driver-configuration
//! issues).
//!
//! ## Error handling philosophy
//!
//! The orchestrator never lets a provider error escape as a raw string match
//! at the call site. Every provider error is classified once, in
//! `cloud::classify`, into one of the variants below. This is the "closed
//! variant, not string matching at the call site" design note: call sites
//! match on `DiskError` variants, never on provider error codes or message
//! substrings directly.
//!
//! ## Retry awareness
//!
//! [`IsRetryable`] tells the retry manager (`retry::RetryManager`) whether an
//! error is worth reattempting. Only `Retryable` and the narrow set of
//! transient provider conditions folded into it are retryable; validation
//! and not-found style errors are not, since retrying them cannot change the
//! outcome.

use thiserror::Error;

/// Closed taxonomy of orchestrator-level errors (spec §7).
#[derive(Error, Debug)]
pub enum DiskError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The chosen device path was already in use on the target instance
    /// (spec §4.F.2 step 4). EC2 reports this as `InvalidParameterValue`
    /// with a prose message rather than a dedicated code; classification
    /// parses that prose once, here, so call sites never re-match on it.
    #[error("device path already in use: {0}")]
    DeviceInUse(String),

    #[error("idempotent parameter mismatch for {volume_name}")]
    IdempotentParameterMismatch { volume_name: String },

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Distinct from the general `LimitExceeded` because `CreateDisk` reacts
    /// to it specially: a volume-limit rejection can mean the provider
    /// already created the volume before rejecting it, so the caller falls
    /// back to a describe-by-name-tag probe before giving up (spec
    /// §4.F.1 step 7).
    #[error("volume limit exceeded")]
    VolumeLimitExceeded,

    #[error("multiple disks match tag {tag_value}")]
    MultiDisks { tag_value: String },

    #[error("multiple snapshots match tag {tag_value}")]
    MultiSnapshots { tag_value: String },

    #[error("disk {name} exists with a different size ({existing_gib} GiB requested {requested_gib} GiB)")]
    DiskExistsDiffSize {
        name: String,
        existing_gib: i64,
        requested_gib: i64,
    },

    #[error("invalid max results: {0} (must be 0 or >= 5)")]
    InvalidMaxResults(i32),

    #[error("still modifying {volume_id}, retry")]
    StillModifying { volume_id: String },

    #[error("timed out waiting for {operation} on {resource_id}")]
    TimedOut {
        operation: String,
        resource_id: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("retryable error (attempt {attempt}/{max_attempts}): {reason}")]
    Retryable {
        attempt: u32,
        max_attempts: u32,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Manual `Clone`: every variant is cloned field-for-field except
/// `Retryable`'s boxed `source`, which is dropped (the `reason` string
/// already carries its message). Needed so a [`DiskError`] delivered to
/// multiple batcher waiters via `Arc` can be rehydrated into an owned error
/// for each waiter.
impl Clone for DiskError {
    fn clone(&self) -> Self {
        match self {
            DiskError::NotFound(s) => DiskError::NotFound(s.clone()),
            DiskError::AlreadyExists(s) => DiskError::AlreadyExists(s.clone()),
            DiskError::InvalidRequest(s) => DiskError::InvalidRequest(s.clone()),
            DiskError::InvalidArgument(s) => DiskError::InvalidArgument(s.clone()),
            DiskError::DeviceInUse(s) => DiskError::DeviceInUse(s.clone()),
            DiskError::IdempotentParameterMismatch { volume_name } => {
                DiskError::IdempotentParameterMismatch {
                    volume_name: volume_name.clone(),
                }
            }
            DiskError::LimitExceeded(s) => DiskError::LimitExceeded(s.clone()),
            DiskError::VolumeLimitExceeded => DiskError::VolumeLimitExceeded,
            DiskError::MultiDisks { tag_value } => DiskError::MultiDisks {
                tag_value: tag_value.clone(),
            },
            DiskError::MultiSnapshots { tag_value } => DiskError::MultiSnapshots {
                tag_value: tag_value.clone(),
            },
            DiskError::DiskExistsDiffSize {
                name,
                existing_gib,
                requested_gib,
            } => DiskError::DiskExistsDiffSize {
                name: name.clone(),
                existing_gib: *existing_gib,
                requested_gib: *requested_gib,
            },
            DiskError::InvalidMaxResults(n) => DiskError::InvalidMaxResults(*n),
            DiskError::StillModifying { volume_id } => DiskError::StillModifying {
                volume_id: volume_id.clone(),
            },
            DiskError::TimedOut {
                operation,
                resource_id,
            } => DiskError::TimedOut {
                operation: operation.clone(),
                resource_id: resource_id.clone(),
            },
            DiskError::Cancelled => DiskError::Cancelled,
            DiskError::Config(_) => DiskError::Internal(self.to_string()),
            DiskError::Retryable {
                attempt,
                max_attempts,
                reason,
                ..
            } => DiskError::Retryable {
                attempt: *attempt,
                max_attempts: *max_attempts,
                reason: reason.clone(),
                source: None,
            },
            DiskError::Provider(s) => DiskError::Provider(s.clone()),
            DiskError::Internal(s) => DiskError::Internal(s.clone()),
        }
    }
}

/// Driver configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DiskError>;

/// Whether an error is worth retrying.
///
/// Used by [`crate::retry::RetryManager`] to decide whether an attempt
/// should be repeated or surfaced immediately. Only `Retryable` and
/// `Provider` (provider-side throttling/transient failures that did not get
/// folded into a more specific taxonomy variant during classification) are
/// retryable by default; everything else represents either a permanent
/// condition (validation, not-found) or something the caller must act on
/// before retrying (idempotent-parameter-mismatch, still-modifying).
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for DiskError {
    fn is_retryable(&self) -> bool {
        matches!(self, DiskError::Retryable { .. } | DiskError::Provider(_))
    }
}
