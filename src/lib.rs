//! Keyword and audience analysis backed by large language models.
//!
//! A request goes through [`tasks::Analyzer`], which prompts the primary
//! provider (OpenAI), fails over to the secondary (Gemini), repairs
//! whatever text comes back into JSON and normalizes it into a typed
//! [`report::StructuredReport`]. With no usable provider a deterministic
//! basic report is produced instead. [`api::router`] exposes it over HTTP.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod parsing;
pub mod progress;
pub mod report;
pub mod tasks;
pub mod tokens;
pub mod tools;

pub use error::AnalysisError;
