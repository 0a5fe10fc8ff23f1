//! # chathead-peer: headless chathead peer
//!
//! Runs one player of a chathead session without a camera or a window:
//! a synthetic source feeds the capture thread and a logging sink stands
//! in for the overlay renderer. Useful for soak tests and for giving a
//! real client somebody to talk to.
//!
//! ## Modes
//!
//! - **Server**: player 0; binds the configured port and relays.
//! - **Client**: connects to a server and gets the lowest free id.

pub mod config;
pub mod metrics;
pub mod peer;
pub mod sink;
