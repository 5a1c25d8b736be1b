//! Best-effort release of broker resources.
//!
//! Closing a channel, a connection or a subscription can each fail
//! independently. [`BestEffort`] runs every registered step regardless of
//! earlier failures, logs each failure, and reports all of them together.

use std::fmt;

use thiserror::Error;
use tracing::warn;

use crate::error::TransportError;

/// Every release step that failed during a best-effort shutdown.
#[derive(Debug, Error)]
#[error("{context}: {} release step(s) failed: {}", .failures.len(), StepList(.failures))]
pub struct ShutdownError {
    context: &'static str,
    failures: Vec<(&'static str, TransportError)>,
}

impl ShutdownError {
    /// What was being shut down, for example `connection object`.
    #[must_use]
    pub fn context(&self) -> &'static str { self.context }

    /// Failed steps paired with their errors, in execution order.
    #[must_use]
    pub fn failures(&self) -> &[(&'static str, TransportError)] { &self.failures }
}

struct StepList<'a>(&'a [(&'static str, TransportError)]);

impl fmt::Display for StepList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (step, error)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{step} ({error})")?;
        }
        Ok(())
    }
}

/// Collects the outcome of independent release steps.
///
/// ```
/// use queuebridge::{error::TransportError, shutdown::BestEffort};
///
/// let mut shutdown = BestEffort::new("demo");
/// shutdown.record("close channel", Err(TransportError::ChannelClosed));
/// shutdown.record("close connection", Ok(()));
/// let err = shutdown.finish().expect_err("one step failed");
/// assert_eq!(err.failures().len(), 1);
/// ```
#[derive(Debug)]
#[must_use]
pub struct BestEffort {
    context: &'static str,
    failures: Vec<(&'static str, TransportError)>,
}

impl BestEffort {
    /// Start collecting release steps for `context`.
    pub fn new(context: &'static str) -> Self {
        Self {
            context,
            failures: Vec::new(),
        }
    }

    /// Record the outcome of `step`, logging a failure.
    pub fn record(&mut self, step: &'static str, outcome: Result<(), TransportError>) {
        if let Err(error) = outcome {
            warn!(context = self.context, step, %error, "release step failed");
            self.failures.push((step, error));
        }
    }

    /// Run an asynchronous release step and record its outcome.
    pub async fn run<F>(&mut self, step: &'static str, release: F)
    where
        F: Future<Output = Result<(), TransportError>>,
    {
        self.record(step, release.await);
    }

    /// Fold in the failures of a nested shutdown. They were logged already.
    pub fn absorb(&mut self, nested: ShutdownError) { self.failures.extend(nested.failures); }

    /// Finish the shutdown.
    ///
    /// # Errors
    ///
    /// Returns a [`ShutdownError`] listing every failed step.
    pub fn finish(self) -> Result<(), ShutdownError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError {
                context: self.context,
                failures: self.failures,
            })
        }
    }
}
