//! porterm - terminal client for a porterminal-style server.
//!
//! One management socket keeps the tab roster in sync; each attached tab gets
//! its own data-plane socket with reconnect, early-data buffering and render
//! flow control.

pub mod app;
pub mod backoff;
pub mod config;
pub mod control;
pub mod flow;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod sink;
pub mod terminal;
