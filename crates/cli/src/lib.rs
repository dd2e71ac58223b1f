//! Command line front end for rxproxy and the worker process entry point.

pub mod cli;
pub mod commands;
pub mod error;
pub mod logging;
pub mod output;
