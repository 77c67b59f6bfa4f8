//! Synthetic scene augmentation: object and text insertion through a remote
//! multimodal generation API, with rate limited, retried batch processing.

#![allow(clippy::multiple_crate_versions)]
#![deny(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::complexity)]
#![deny(clippy::correctness)]
#![deny(clippy::disallowed_methods)]
#![deny(clippy::expect_used)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::panic)]
#![deny(clippy::perf)]
#![deny(clippy::trivially_copy_pass_by_ref)]
#![deny(clippy::unreachable)]
#![deny(clippy::unwrap_used)]
#![deny(warnings)]
#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod analyzer;
pub mod api;
pub mod cli;
pub mod commands;
pub mod config;
pub mod constants;
pub mod error;
pub mod limiter;
pub mod orchestrator;
pub mod output;
pub mod prompt;
pub mod report;
pub mod retry;
pub mod scheduler;
