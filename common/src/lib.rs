//! Shared types and constants for packet latency correlation
//!
//! This crate provides the value types exchanged between the trace parser,
//! the packet extractor, the correlation table and the report layer.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod constants;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use types::{
    CorrelationKey, CorrelationMode, DeviceSide, Direction, Latency, Leg, PipelinePoint,
    PointMask, SkbAddr, SyscallPoint, Timestamp, TimestampError,
};
