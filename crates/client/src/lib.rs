//! Client for ferry.
//!
//! [`FerryClient`] uploads a byte source as fixed-size chunks, resumes an
//! interrupted upload from the server's cursor, and downloads shared files
//! with byte ranges. Calls go through a [`Transport`]; [`HttpTransport`]
//! speaks the server's HTTP API. Transient failures are retried with
//! exponential backoff according to a [`RetryPolicy`].

pub mod client;
pub mod error;
pub mod retry;
pub mod transport;

pub use client::{DownloadOutcome, FerryClient, UploadOutcome};
pub use error::{ClientError, Result};
pub use retry::RetryPolicy;
pub use transport::{DownloadBody, HttpTransport, Transport};
