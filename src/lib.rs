//! `reqwire` is an HTTP request client built around a per-request
//! coordinator: bounded retries with a fixed delay, an overall deadline plus
//! a per-attempt watchdog, abort at any time, response headers normalized
//! across redirects, and fan-out of the response body to several sinks.
//! Every request delivers exactly one outcome.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqwire::prelude::{Client, Config, FileSink, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .config(
//!             Config::default()
//!                 .timeout(Duration::from_secs(3))
//!                 .retries(2)
//!                 .retry_delay(Duration::from_millis(200)),
//!         )
//!         .try_build()?;
//!
//!     let response = client.get("https://example.com/").await?;
//!     println!("status={} bytes={}", response.status(), response.body().len());
//!
//!     let file = FileSink::create("download.bin").await?;
//!     let download = client
//!         .request(RequestOptions::new("https://example.com/").wait(true))
//!         .pipe(file)
//!         .send()
//!         .await?;
//!     println!("saved after {} attempt(s)", download.attempts());
//!     Ok(())
//! }
//! ```
//!
//! # Outcomes
//!
//! - A final response, even with a bad status, is `Ok(Response)` unless
//!   `StatusPolicy::Error` is selected.
//! - Failures carry a numeric `code()` and an HTTP-like `status()`, e.g.
//!   `408` for timeouts and `499` for aborts.

mod body;
mod client;
mod config;
mod coordinator;
mod error;
mod headers;
mod latch;
mod metrics;
mod observe;
mod request;
mod response;
mod retry;
mod sink;
mod timer;
pub mod transport;
mod util;

pub use crate::body::Body;
#[cfg(feature = "hyper-transport")]
pub use crate::client::request;
pub use crate::client::{Client, ClientBuilder};
pub use crate::config::{
    Config, DEFAULT_USER_AGENT, ProxySetting, RequestConfig, RequestOptions, StatusPolicy,
};
pub use crate::error::{Error, ErrorKind, SharedError, TimeoutPhase, TransportErrorKind};
pub use crate::headers::{HeaderOverride, normalize_response_headers};
pub use crate::metrics::MetricsSnapshot;
pub use crate::observe::{Observer, RequestContext};
pub use crate::request::{AbortHandle, RequestHandle};
pub use crate::response::Response;
pub use crate::retry::{
    AttemptOutcome, BadStatusClassifier, DEFAULT_BAD_STATUSES, RetryPolicy, RetryVerdict,
    StandardBadStatus,
};
pub use crate::sink::{FileSink, Sink, WriterSink};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::transport::{AttemptEvents, AttemptHandle, AttemptRequest, Transport};
    pub use crate::{
        AbortHandle, Body, Client, Config, Error, ErrorKind, FileSink, HeaderOverride,
        ProxySetting, RequestHandle, RequestOptions, Response, RetryPolicy, Sink, StatusPolicy,
        TimeoutPhase, TransportErrorKind, WriterSink,
    };
}

#[cfg(test)]
mod tests;
