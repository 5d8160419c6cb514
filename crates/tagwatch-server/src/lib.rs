//! # tagwatch-server
//!
//! HTTP front end for the tagwatch tag engine: REST handlers, configuration,
//! logging and the production collaborators (remote verifier, alarm sink).

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod audio;
pub mod config;
pub mod logging;
pub mod runtime;
pub mod state;
pub mod verify;
