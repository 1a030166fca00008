pub mod app;
pub mod auth;
pub mod channels;
pub mod config;
pub mod error;
pub mod inbound;
pub mod merge;
pub mod outbound;
pub mod presence;
pub mod realtime;
pub mod relay;
pub mod store;
pub mod templates;
pub mod types;
pub mod unread;

pub use error::RelayError;
pub use relay::ChatRelay;
