//! Error types for loader and manager operations.

use crate::loader::LoaderId;

/// Errors returned by loader, handle and manager operations.
///
/// None of these are fatal: the manager stays usable after any of them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoaderError {
  /// Operation called in a lifecycle state that does not allow it.
  #[error("Invalid state: {0}")]
  InvalidState(String),
  /// A required argument was missing or did not match.
  #[error("Invalid argument: {0}")]
  InvalidArgument(String),
  /// The factory callback could not produce a loader.
  #[error("Failed to create loader {id}: {message}")]
  Factory { id: LoaderId, message: String },
}

impl LoaderError {
  /// Create an invalid-state error.
  pub fn invalid_state(msg: impl Into<String>) -> Self {
    Self::InvalidState(msg.into())
  }

  /// Create an invalid-argument error.
  pub fn invalid_argument(msg: impl Into<String>) -> Self {
    Self::InvalidArgument(msg.into())
  }

  /// Create a factory error for `id`.
  pub fn factory(id: LoaderId, message: impl Into<String>) -> Self {
    Self::Factory {
      id,
      message: message.into(),
    }
  }
}

/// Outcome of a failed background load.
///
/// Every variant is dispatched as a cancellation-like outcome so the loader's
/// bookkeeping stays consistent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
  #[error("Load failed: {0}")]
  Failed(String),

  #[error("Load was cancelled")]
  Cancelled,

  #[error("Load panicked: {0}")]
  Panicked(String),
}

impl LoadError {
  pub fn failed(msg: impl Into<String>) -> Self {
    Self::Failed(msg.into())
  }
}
