//! Topic-driven actor dispatch.
//!
//! # Main Components
//!
//! - [`Actor`] - Contract each device family implements
//! - [`DispatchContext`] - Settings, publisher and device library handed to every callback
//! - [`Dispatcher`] - Subscribes each [`Route`] and consumes its message stream
//! - [`ActorError`] - Per-message failures, logged and contained by the callbacks
//!
//! # Testing
//!
//! See [`mock`] module for an in-memory broker and device library.

pub mod core;
pub mod dispatch;
pub mod mock;

pub use self::core::*;
pub use dispatch::{default_registry, Dispatcher, Registry, Route, RoutePurpose};
