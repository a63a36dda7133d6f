//! The per-entry audit log.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//------------ AuditAction ---------------------------------------------------

/// The registry actions that leave an audit trail.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    CreateCertificate,
    CreateCertificateRequest,
    ResetRevocationList,
    SetAttributes,
    MergeImported,
    AccessKey,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditAction::CreateCertificate => "create_certificate",
            AuditAction::CreateCertificateRequest => "create_certificate_request",
            AuditAction::ResetRevocationList => "reset_revocation_list",
            AuditAction::SetAttributes => "set_attributes",
            AuditAction::MergeImported => "merge_imported",
            AuditAction::AccessKey => "access_key",
        };
        s.fmt(f)
    }
}

//------------ AuditRecord ---------------------------------------------------

/// One record in an entry's append-only audit log.
///
/// Records are never rewritten or removed; every mutation of an entry, and
/// every private key access, appends a new record.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub user: String,
    pub action: AuditAction,
    pub details: String,
}

impl AuditRecord {
    pub fn new(user: &str, action: AuditAction, details: impl Into<String>) -> Self {
        AuditRecord {
            timestamp: Utc::now(),
            user: user.to_string(),
            action,
            details: details.into(),
        }
    }
}

impl fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} by '{}' ({})",
            self.timestamp.to_rfc3339(),
            self.action,
            self.user,
            self.details
        )
    }
}

//------------ Tests ---------------------------------------------------------
