//! Sans-I/O state machines for PostgreSQL protocol.
//!
//! These state machines handle the protocol logic without performing any I/O.
//! They produce `Action` values that tell the caller what to do next, which
//! lets the same machine run behind a blocking socket or be advanced one
//! `poll()` at a time on a non-blocking one.

pub mod action;
pub mod simple_query;
pub mod startup;

pub use action::{Action, AsyncMessage};
pub use simple_query::SimpleQueryStateMachine;
pub use startup::{StartupState, StartupStateMachine};
