// Deposit reconciliation: acceptance rules, dedup bookkeeping and refunds

pub mod issuer;
pub mod processed;
pub mod verification;
pub mod verifier;

pub use issuer::{RefundIssuer, RefundOutcome};
pub use processed::ProcessedSet;
pub use verification::{DepositVerificationService, VerificationConfig, VerificationResult};
pub use verifier::{RejectionReason, TransferVerifier, Verdict};
