//! pull-box: pull OCI images into `docker load` tarballs
//!
//! Resolves an image reference against an OCI Distribution registry,
//! reports byte-level download progress, and writes config, layers, and
//! `manifest.json` into a single archive.
//!
//! # Key Features
//!
//! - **Two-pass pull**: sizes the image before any layer byte is read, so
//!   progress always has a known total
//! - **Pluggable transport**: native `reqwest`, or a fetch primitive owned
//!   by an embedding host
//! - **Verified streaming**: every layer is length- and digest-checked on
//!   its way into the archive, and a failed pull leaves no file behind
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use pull_box::{config::Config, pipeline::Puller, progress::ConsoleProgress};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(Path::new("config.json"))?;
//!     let progress = ConsoleProgress::new();
//!
//!     let report = Puller::native()?
//!         .pull_to_file(
//!             "nginx:latest",
//!             Path::new("nginx.tar"),
//!             &config.authenticator(),
//!             Arc::new(progress.clone()),
//!         )
//!         .await?;
//!     progress.finish();
//!
//!     println!("saved {} to {}", report.reference, report.output.display());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod host;
pub mod pipeline;
pub mod progress;

pub use error::{Error, ErrorKind, Result, Stage};
pub use host::{Deferred, HostAdapter, Rejection};
pub use pipeline::{PullReport, Puller};
