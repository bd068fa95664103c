//! Message definitions and the DBC loader
//!
//! The DBC grammar itself is handled by the `can-dbc` crate; this module
//! converts its output into the definitions the decoder and filter builder
//! work from.

pub mod database;
pub mod dbc;

pub use database::{
    ByteOrder, DatabaseStats, MessageDatabase, MessageDefinition, MultiplexerInfo,
    SignalDefinition, ValueType,
};
