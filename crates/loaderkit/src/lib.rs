//! Lifecycle-aware asynchronous loaders.
//!
//! A [`LoaderManager`] keeps a registry of [`Loader`]s keyed by [`LoaderId`] and
//! drives them from the lifecycle of the component that owns it (started,
//! stopped, retained across a reconfiguration, destroyed). Background work runs
//! on an [`Executor`]; outcomes come back through the manager's [`Scheduler`]
//! and are only ever applied on the owner thread.
//!
//! # Architecture
//!
//! ```text
//! owner lifecycle ──▶ LoaderManagerHost ──▶ LoaderManager ──▶ LoaderHandle ──▶ Loader
//!                                               ▲                               │
//!                                               │        Executor (worker)  ◀───┘
//!                                               └──── Scheduler (inbox + timers)
//! ```
//!
//! - [`Loader`] is a flag record ([`LoaderState`]) plus a [`LoaderBehavior`]
//!   strategy. [`ThrottledLoader`] is the stock behavior that runs a
//!   [`LoadInBackground`] strategy with an optional [`Throttle`].
//! - [`LoaderHandle`] tracks delivered data, retain state and a pending
//!   replacement for one id.
//! - [`ContentObserver`] lets external sources signal a change from any thread.

pub mod config;
mod error;
mod executor;
mod loader;
mod manager;
mod observer;
mod scheduler;

pub use error::{LoadError, LoaderError};
#[cfg(any(test, feature = "test-utils"))]
pub use executor::ManualExecutor;
pub use executor::{BlockingPoolExecutor, Executor, InlineExecutor, Job};
pub use loader::{
  LoadInBackground, Loader, LoaderArgs, LoaderBehavior, LoaderContext, LoaderId, LoaderKey, LoaderState, TaskId,
  Throttle, ThrottledLoader,
};
pub use manager::{LoaderCallbacks, LoaderHandle, LoaderManager, LoaderManagerHost, ROOT_WHO, RetainedManagers};
pub use observer::{ContentObservable, ContentObserver};
pub use scheduler::Scheduler;
