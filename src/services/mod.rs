//! CRUD entry points that carry side effects beyond the store.
//!
//! Each function commits the local change first, releases the database
//! guard, and only then emits notifications. A failed emit is logged by the
//! notification service and never turns a committed change into an error.

pub mod activities;
pub mod chat;
pub mod deals;
pub mod leads;
