//! Adaptive content acquisition engine.
//!
//! The pipeline, front to back: the orchestrator walks active sources in
//! priority batches; each listing page is validated for legitimacy and, when
//! a protection page is served instead, handed to the bypass engine; link
//! discovery turns the listing into vetted article URLs (redirects resolved
//! before classification); article pages are extracted with learned selector
//! rules, validated again, de-duplicated by URL, and enqueued for
//! asynchronous classification.

pub mod bypass;
pub mod classifier;
pub mod classify_queue;
pub mod corruption;
pub mod discovery;
pub mod extract;
pub mod fetch;
pub mod links;
pub mod orchestrator;
pub mod policy;
pub mod redirect;
pub mod run_log;
pub mod store;
pub mod structure;
pub mod traits;
pub mod validation;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;
