pub mod api;
pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod deposit;
pub mod error;
pub mod execution;
pub mod explorer;
pub mod ledger;
pub mod monitor;
pub mod server;

#[cfg(test)]
pub mod test_utils;
