//! Streaming relay between a music catalog and a local audio player.
//!
//! Players cannot play catalog tracks directly: upstream stream URLs are
//! signed, expire after a few hours and carry no "now playing" metadata.
//! This crate hides both problems behind a local HTTP server:
//!
//! * [`resolver`] turns track ids into upstream URLs through a slow
//!   [`extractor`], caching results for a freshness window
//! * [`proxy`] serves `/proxy/{track_id}`, resolving on demand and relaying
//!   the audio with ICY metadata from the [`store`]
//!
//! A playlist synchronizer batch-resolves tracks, writes their metadata to
//! the store, and points the player at [`proxy::Proxy::track_url`].
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate log;

pub mod cache;
pub mod config;
pub mod error;
pub mod extractor;
pub mod gate;
pub mod http;
pub mod icy;
pub mod proxy;
pub mod resolver;
pub mod session;
pub mod signal;
pub mod store;
pub mod track_id;
pub mod uuid;
