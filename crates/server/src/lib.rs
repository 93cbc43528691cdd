//! Device availability broker
//!
//! The broker watches the kernel device model, keeps a canonical table of
//! currently-present devices, serves availability queries and subscriptions
//! over a Unix control socket, and mirrors tagged devices into the init
//! supervisor as synthetic `device@...` services.
//!
//! The binary lives in `main.rs`; everything else is exposed as a library
//! so integration tests can assemble a broker from test parts (scripted
//! device source, scripted supervisor session, temporary socket).

pub mod bridge;
pub mod broker;
pub mod devsrc;
pub mod registry;
pub mod table;
