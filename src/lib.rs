//! multirun — parallel line-oriented job executor.
//!
//! Reads one JSON record per input line, distributes the records across a
//! pool of long-lived worker processes speaking a line-oriented wire
//! protocol, and writes one result line per record to the output. The
//! core is the supervisor: process lifecycle, input multiplexing, output
//! demultiplexing, resilience to worker death, cooperative shutdown, and
//! resource-aware pool sizing.

pub mod protocol;
pub mod signals;
pub mod sink;
pub mod sizing;
pub mod source;
pub mod spec;
pub mod supervisor;
pub mod worker;

#[cfg(feature = "stats")]
pub mod stats;
