pub mod async_webhook;
pub mod handler;
pub mod models;

pub use async_webhook::WebhookNotifier;
pub use handler::AppState;
