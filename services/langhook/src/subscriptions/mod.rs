//! Subscription routing and delivery.
//!
//! `repo` owns the persistence; `nlp` compiles natural-language
//! descriptions into subject patterns (plus optional gate prompts); `gate`
//! evaluates per-event LLM gates; `consumer` runs one worker per active
//! subscription; `supervisor` keeps the worker set in sync with the store;
//! `webhook` performs single-attempt deliveries.

pub mod budget;
pub mod consumer;
pub mod gate;
pub mod nlp;
pub mod repo;
pub mod supervisor;
pub mod webhook;
