#![forbid(unsafe_code)]
#![deny(missing_docs)]
//! # pa-jail CLI
//!
//! This crate provides the `pa-jail` binary on top of `pa-jail-core`. It
//! is responsible for parsing and validating command-line arguments,
//! opening caller-owned descriptors before privilege promotion, and
//! dispatching to the core subsystems.
//!
//! ## Architecture
//!
//! - **CLI logic**: argument parsing and validation live here.
//! - **Core jail machinery**: authorization, population, supervision,
//!   and teardown are delegated to the `pa-jail-core` crate.

pub mod parser;
pub mod runner;

pub use parser::Cli;
