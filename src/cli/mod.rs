//! Terminal rendering for the command-line interface

pub mod chart;
pub mod history;
pub mod search;
pub mod session;
pub mod setup;
pub mod ui;
