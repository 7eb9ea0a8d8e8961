//! Duplicate function call suppression.
//!
//! A [`Group`] makes sure that at most one execution of a piece of work is in
//! flight per key. Callers that ask for the same key while that execution is
//! running wait for it and receive the very same result, value or error.
//! Once the call returns its entry is gone, so the next caller starts a new
//! execution; nothing is cached.
//!
//! ```
//! use singleflight::Group;
//! use std::sync::Arc;
//!
//! let group: Group<String, Arc<std::io::Error>> = Group::new();
//! let value = group.work("key", || Ok("bar".to_string()));
//! assert_eq!(value.unwrap(), "bar");
//! ```
//!
//! [`AsyncGroup`] offers the same contract to async callers. Results and
//! errors are handed to every waiter by `Clone`; wrap the error in an `Arc`
//! when waiters must observe the same error instance.

mod async_group;
mod group;

pub use async_group::AsyncGroup;
pub use group::Group;
