//! Session-aware follow-up-rewriting gateway.
//!
//! Sits in front of the core Query API. Tracks per-session conversational
//! state (the last entity discussed), rewrites context-dependent follow-up
//! queries before forwarding them, and shortcuts course-schedule questions
//! straight to the relational store via the core API's dedicated endpoint.

pub mod rewrite;
pub mod server;
pub mod store;
