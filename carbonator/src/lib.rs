//! The carbonator host metrics agent.
//!
//! This library supports the carbonator binary found elsewhere in this
//! project. A [`engine::Engine`] samples operating system counters through a
//! [`counter::Source`], one [`watcher::Watcher`] per configured selector, and
//! hands every sample to each configured [`output::Client`]. Outputs own a
//! bounded buffer and deliver on their own cadence so that a slow or absent
//! backend never stalls collection.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![warn(unreachable_pub)]
#![warn(missing_docs)]
#![warn(missing_copy_implementations)]
#![warn(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod counter;
pub mod engine;
pub mod metric;
pub mod output;
pub mod signals;
pub mod template;
pub(crate) mod timer;
pub mod watcher;
