//! Run-control coordination for distributed data-acquisition participants.
//!
//! The crate has three cooperating layers:
//!
//! - a hierarchical variable [`store`] carrying the shared run-control
//!   schema and a change feed, with [`control`] as the typed authority API
//!   over it;
//! - a message plane ([`protocol`], [`transport`]) connecting the
//!   [`dispatcher`] authority to client [`monitor`]s over request/reply and
//!   publish/subscribe channels;
//! - a supervision layer ([`event_loop`], [`supervise`]) that starts
//!   participants on remote hosts, multiplexes their output, and reacts to
//!   failures.

pub mod config;
pub mod control;
pub mod dispatcher;
pub mod error;
pub mod event_loop;
pub mod monitor;
pub mod protocol;
pub mod store;
pub mod supervise;
pub mod transition;
pub mod transport;
