//! Agentic Assist: email triage and reply drafting core.

pub mod config;
pub mod error;
pub mod llm;
pub mod mail;
pub mod memory;
pub mod pipeline;
