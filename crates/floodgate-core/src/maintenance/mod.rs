//! Background maintenance plumbing.
//!
//! The cache expiry sweep, the rate limiter idle cleanup and the batch writer
//! flush timer all run as [`BackgroundTask`] loops: a tokio interval raced
//! against a broadcast shutdown signal.

mod task;

pub use task::BackgroundTask;
