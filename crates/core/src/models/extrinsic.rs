//! Submitted extrinsics and their lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Account;
use crate::error::ExtrinsicError;

/// Queue-local identifier of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtrinsicId(pub u64);

impl fmt::Display for ExtrinsicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle status of a submitted extrinsic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtrinsicStatus {
    Pending,
    InBlock,
    Finalized,
    Failed,
}

impl ExtrinsicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtrinsicStatus::Pending => "pending",
            ExtrinsicStatus::InBlock => "in_block",
            ExtrinsicStatus::Finalized => "finalized",
            ExtrinsicStatus::Failed => "failed",
        }
    }

    /// Finalized and Failed never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExtrinsicStatus::Finalized | ExtrinsicStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            ExtrinsicStatus::Pending => 0,
            ExtrinsicStatus::InBlock => 1,
            ExtrinsicStatus::Finalized | ExtrinsicStatus::Failed => 2,
        }
    }

    /// Whether moving to `next` is a forward transition.
    pub fn can_advance_to(&self, next: ExtrinsicStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Progress event pushed by the chain client for one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxEvent {
    /// Signed and accepted for broadcast.
    Pending,
    /// Included in a best block.
    InBlock,
    /// Included in a finalized block and dispatched successfully.
    Finalized,
    /// Rejected, dropped or failed on dispatch.
    Failed(ExtrinsicError),
}

impl TxEvent {
    pub fn status(&self) -> ExtrinsicStatus {
        match self {
            TxEvent::Pending => ExtrinsicStatus::Pending,
            TxEvent::InBlock => ExtrinsicStatus::InBlock,
            TxEvent::Finalized => ExtrinsicStatus::Finalized,
            TxEvent::Failed(_) => ExtrinsicStatus::Failed,
        }
    }
}

/// Queue entry for a write request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmittedExtrinsic {
    pub id: ExtrinsicId,
    pub from: Account,
    /// Method identifier, e.g. `staking.unbond`.
    pub method: String,
    pub params: serde_json::Value,
    pub status: ExtrinsicStatus,
    /// Present iff `status` is `Failed`.
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<ExtrinsicError>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubmittedExtrinsic {
    pub fn pending(
        id: ExtrinsicId,
        from: Account,
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        let now = super::now();
        Self {
            id,
            from,
            method: method.into(),
            params,
            status: ExtrinsicStatus::Pending,
            error: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    /// Apply a progress event. Returns `false` when it is not a forward transition.
    pub fn apply(&mut self, event: &TxEvent) -> bool {
        let next = event.status();
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        if let TxEvent::Failed(error) = event {
            self.error = Some(error.clone());
        }
        self.updated_at = super::now();
        true
    }
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<ExtrinsicError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.serialize_some(&error.to_string()),
        None => serializer.serialize_none(),
    }
}
