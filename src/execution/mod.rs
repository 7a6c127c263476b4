pub mod refund;

pub use refund::{HttpRefundSubmitter, RefundServiceConfig, RefundSubmitter};
