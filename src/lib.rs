//! Nuvra CRM backend core.
//!
//! - `sync`: Google Calendar bridge for Activities
//! - `notifications`: persisted, broadcast notifications from templates
//! - `integrations`: outbound dispatch to messaging and automation services
//! - `server`: webhook and OAuth function endpoints
//! - `reports`: period overview of the sales pipeline

pub mod config;
pub mod db;
pub mod error;
pub mod google_api;
pub mod integrations;
mod migrations;
pub mod notifications;
pub mod reports;
pub mod server;
pub mod services;
pub mod state;
pub mod sync;
pub mod timeline;
pub mod util;

pub use error::{CrmError, ErrorReport};
