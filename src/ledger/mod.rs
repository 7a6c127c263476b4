pub mod memory;
pub mod models;
pub mod repository;

pub use memory::InMemoryDepositStore;
pub use repository::{DepositStore, PgDepositStore};
