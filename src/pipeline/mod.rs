//! Email triage and draft pipeline.
//!
//! Every unread message flows through:
//! 1. `MailProvider::list_unread()`: provider-specific I/O
//! 2. `parser::parse()`: raw RFC 822 → `Message`
//! 3. `RulesEngine::evaluate()`: fast pattern matching (no LLM)
//! 4. `TriageClassifier::classify()`: LLM-powered triage
//! 5. `DraftComposer::compose()`: reply text with thread context
//! 6. `MailProvider::create_draft()`: saved as a draft, never sent
//!
//! **No send path exists.** The pipeline only ever creates drafts.

pub mod composer;
pub mod ledger;
pub mod orchestrator;
pub mod parser;
pub mod retry;
pub mod rules;
pub mod runner;
pub mod triage;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;
