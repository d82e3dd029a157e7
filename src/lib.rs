//! Bulk outreach — personalized, capped, auditable email dispatch.

pub mod compose;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod llm;
pub mod personalize;
pub mod recipients;
pub mod recorder;
pub mod sink;
