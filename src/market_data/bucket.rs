// =============================================================================
// Time bucketing — maps tick timestamps onto aligned candle buckets
// =============================================================================
//
// All bucket arithmetic stays in integer milliseconds. Deriving buckets from
// a floating-point "seconds" timestamp loses precision once intervals drop
// below one second, so seconds only appear at the presentation boundary.
// =============================================================================

/// Start of the bucket containing `timestamp_ms`, in integer milliseconds.
///
/// This is the authoritative bucket identity: the aggregator compares these
/// values, never their second-truncated forms. Pure and total for
/// `interval_ms > 0`; same input always yields the same output, so replaying
/// a tick stream is idempotent.
pub fn bucket_start_ms(timestamp_ms: i64, interval_ms: i64) -> i64 {
    debug_assert!(interval_ms > 0, "interval must be validated upstream");
    timestamp_ms.div_euclid(interval_ms) * interval_ms
}

/// Bucket start in whole seconds, for the candle presented to consumers.
pub fn bucket_start_secs(timestamp_ms: i64, interval_ms: i64) -> i64 {
    bucket_start_ms(timestamp_ms, interval_ms).div_euclid(1000)
}
