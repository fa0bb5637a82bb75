//! Command handlers

pub mod config;
pub mod document;
pub mod serve;
pub mod watch;
