//! Credit-aware job runner shared by the LeadGrid enrichment tools.
//!
//! The runner drives a CSV of input rows through a metered third-party API
//! under four simultaneous constraints: a pool of credentials with bounded,
//! persisted credit quotas; a global rate/concurrency envelope; checkpointed
//! at-least-once progress so a killed run resumes without re-spending
//! credits; and graceful cancellation that drains in-flight calls.

pub mod cancel;
pub mod config;
pub mod driver;
pub mod governor;
pub mod http;
pub mod report;
pub mod runner;
pub mod store;
pub mod tools;
pub mod wallet;
