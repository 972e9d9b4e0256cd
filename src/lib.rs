//! remitflow - claim bucketing, threshold gating and release lifecycle

pub mod pipeline;
