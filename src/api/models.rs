use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use crate::error::ReconcileError;
use crate::monitor::{TickOutcome, TickReport};

// ========== REQUEST MODELS ==========

/// Register a source address ahead of its transfer
#[derive(Debug, Deserialize, Validate)]
pub struct RegisterDepositRequest {
    #[validate(length(min = 55, max = 120, message = "address length is out of range"))]
    pub source_address: String,

    pub owner_id: Option<Uuid>,

    /// Overrides the monitor's required amount for this deposit
    #[validate(range(min = 1, message = "required_amount must be positive"))]
    pub required_amount: Option<u64>,
}

// ========== RESPONSE MODELS ==========

/// Result of a start/stop request
#[derive(Debug, Serialize)]
pub struct MonitorActionResponse {
    pub action: String,
    /// `false` when the monitor was already in the requested state
    pub changed: bool,
    pub is_running: bool,
}

/// Result of a manual check
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckResponse {
    CooledDown { until: DateTime<Utc> },
    Completed { report: TickReport },
}

/// Failed ticks surface as errors instead
impl TryFrom<TickOutcome> for CheckResponse {
    type Error = ReconcileError;

    fn try_from(outcome: TickOutcome) -> Result<Self, Self::Error> {
        match outcome {
            TickOutcome::CooledDown { until } => Ok(Self::CooledDown { until }),
            TickOutcome::Completed(report) => Ok(Self::Completed { report }),
            TickOutcome::Failed(e) => Err(e),
        }
    }
}

/// Flatten validator output into one readable line
pub fn format_validation_errors(errors: &ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| match &e.message {
                Some(message) => format!("{}: {}", field, message),
                None => format!("{}: {}", field, e.code),
            })
        })
        .collect();
    messages.sort();
    messages.join("; ")
}
