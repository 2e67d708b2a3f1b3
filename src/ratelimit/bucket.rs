//! Token bucket state and refill arithmetic.
//!
//! A bucket is stored as a hash with three fields: `count` (real-valued
//! tokens), `refilled_at_ms` (the last whole-token sync point) and `version`.
//! Refill only credits whole tokens and advances `refilled_at_ms` by exactly
//! the time those tokens took, so the fractional remainder carries over to
//! the next evaluation.

use crate::store::{FieldMap, ABSENT_VERSION, VERSION_FIELD};

/// Hash field holding the token count.
pub const COUNT_FIELD: &str = "count";
/// Hash field holding the last refill instant in epoch milliseconds.
pub const REFILLED_AT_FIELD: &str = "refilled_at_ms";

/// How far ahead of the local clock a stored sync point may be before the
/// record is considered corrupt. Covers clock skew between writers.
pub const MAX_FUTURE_SKEW_MS: i64 = 60 * 60 * 1000;

/// Capacity and refill rate of a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    /// Capacity in tokens.
    pub max: f64,
    /// Milliseconds needed to regenerate one token.
    pub refill_interval_ms: f64,
}

/// Decoded bucket record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketRecord {
    pub count: f64,
    pub refilled_at_ms: i64,
}

impl BucketRecord {
    /// A full bucket synced at `now_ms`.
    pub fn full(params: &BucketParams, now_ms: i64) -> Self {
        Self {
            count: params.max,
            refilled_at_ms: now_ms,
        }
    }

    /// Decode from stored fields. Returns `None` if a field is missing,
    /// does not parse, or holds a sync point that is negative or further
    /// than [`MAX_FUTURE_SKEW_MS`] ahead of `now_ms`.
    pub fn decode(fields: &FieldMap, now_ms: i64) -> Option<Self> {
        let count: f64 = fields.get(COUNT_FIELD)?.parse().ok()?;
        let refilled_at_ms: i64 = fields.get(REFILLED_AT_FIELD)?.parse().ok()?;
        if !count.is_finite() || count < 0.0 {
            return None;
        }
        if refilled_at_ms < 0 || refilled_at_ms > now_ms.saturating_add(MAX_FUTURE_SKEW_MS) {
            return None;
        }
        Some(Self {
            count,
            refilled_at_ms,
        })
    }

    /// Encode as store fields tagged with `version`.
    pub fn encode(&self, version: &str) -> Vec<(String, String)> {
        vec![
            (COUNT_FIELD.to_string(), self.count.to_string()),
            (REFILLED_AT_FIELD.to_string(), self.refilled_at_ms.to_string()),
            (VERSION_FIELD.to_string(), version.to_string()),
        ]
    }
}

/// A bucket as read from the store, with the version any write must match.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// `None` when the key is absent or its fields are malformed.
    pub record: Option<BucketRecord>,
    pub version: String,
    /// The key existed but could not be decoded.
    pub malformed: bool,
}

impl Snapshot {
    pub fn from_fields(fields: Option<FieldMap>, now_ms: i64) -> Self {
        match fields {
            None => Self {
                record: None,
                version: ABSENT_VERSION.to_string(),
                malformed: false,
            },
            Some(fields) => {
                let record = BucketRecord::decode(&fields, now_ms);
                let version = fields
                    .get(VERSION_FIELD)
                    .cloned()
                    .unwrap_or_else(|| ABSENT_VERSION.to_string());
                Self {
                    malformed: record.is_none(),
                    record,
                    version,
                }
            }
        }
    }
}

/// Outcome of applying refill and admission to a snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Bucket state after the decision.
    pub record: BucketRecord,
    /// Instant the bucket will be full again, in epoch milliseconds.
    pub resets_at_ms: i64,
}

impl Decision {
    /// Whole tokens left.
    pub fn remaining(&self) -> u64 {
        self.record.count.floor() as u64
    }
}

/// Refill `record` up to `now_ms`, then try to take `cost` tokens.
///
/// Tokens are only removed when `mutate` is set; otherwise the decision is a
/// preview.
pub fn evaluate(
    record: Option<BucketRecord>,
    params: &BucketParams,
    now_ms: i64,
    cost: f64,
    mutate: bool,
) -> Decision {
    let mut bucket = record.unwrap_or_else(|| BucketRecord::full(params, now_ms));
    // Capacity may have been lowered since the record was written.
    bucket.count = bucket.count.min(params.max);

    let elapsed_ms = now_ms.saturating_sub(bucket.refilled_at_ms);
    if elapsed_ms > 0 {
        let refill = (elapsed_ms as f64 / params.refill_interval_ms).floor();
        if refill > 0.0 {
            bucket.count = (bucket.count + refill).min(params.max);
            bucket.refilled_at_ms = bucket
                .refilled_at_ms
                .saturating_add((refill * params.refill_interval_ms).round() as i64);
        }
    }

    let allowed = bucket.count >= cost;
    if mutate && allowed {
        bucket.count -= cost;
    }

    let resets_at_ms = bucket
        .refilled_at_ms
        .saturating_add(((params.max - bucket.count) * params.refill_interval_ms).ceil() as i64);

    Decision {
        allowed,
        record: bucket,
        resets_at_ms,
    }
}

/// Whole seconds until the bucket is full again, never less than one.
pub fn ttl_secs(resets_at_ms: i64, now_ms: i64) -> u64 {
    let remaining_ms = resets_at_ms.saturating_sub(now_ms).max(0) as u64;
    remaining_ms.div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    fn params(max: f64, interval_secs: f64) -> BucketParams {
        BucketParams {
            max,
            refill_interval_ms: interval_secs * 1000.0,
        }
    }

    fn record(count: f64, refilled_at_ms: i64) -> Option<BucketRecord> {
        Some(BucketRecord {
            count,
            refilled_at_ms,
        })
    }

    #[test]
    fn test_absent_record_starts_full() {
        let p = params(5.0, 10.0);
        let d = evaluate(None, &p, T0, 1.0, true);

        assert!(d.allowed);
        assert_eq!(d.record.count, 4.0);
        assert_eq!(d.record.refilled_at_ms, T0);
        assert_eq!(d.remaining(), 4);
        assert_eq!(d.resets_at_ms, T0 + 10_000);
    }

    #[test]
    fn test_preview_does_not_take_tokens() {
        let p = params(5.0, 10.0);
        let d = evaluate(record(2.0, T0), &p, T0, 1.0, false);

        assert!(d.allowed);
        assert_eq!(d.record.count, 2.0);
        assert_eq!(d.resets_at_ms, T0 + 30_000);
    }

    #[test]
    fn test_denied_when_cost_exceeds_count() {
        let p = params(5.0, 10.0);
        let d = evaluate(record(0.0, T0), &p, T0 + 9_999, 1.0, true);

        assert!(!d.allowed);
        assert_eq!(d.remaining(), 0);
        assert_eq!(d.record.refilled_at_ms, T0);
    }

    #[test]
    fn test_refill_keeps_fractional_remainder() {
        let p = params(5.0, 10.0);
        // 25s elapsed: two whole tokens, 5s carried over.
        let d = evaluate(record(0.0, T0), &p, T0 + 25_000, 1.0, false);

        assert_eq!(d.record.count, 2.0);
        assert_eq!(d.record.refilled_at_ms, T0 + 20_000);

        // Another 5s completes the third token.
        let d = evaluate(Some(d.record), &p, T0 + 30_000, 1.0, false);
        assert_eq!(d.record.count, 3.0);
        assert_eq!(d.record.refilled_at_ms, T0 + 30_000);
    }

    #[test]
    fn test_refill_caps_at_max() {
        let p = params(5.0, 1.0);
        let d = evaluate(record(1.0, T0), &p, T0 + 3_600_000, 1.0, false);

        assert_eq!(d.record.count, 5.0);
        assert_eq!(d.resets_at_ms, d.record.refilled_at_ms);
    }

    #[test]
    fn test_clock_behind_record_never_moves_it_back() {
        let p = params(5.0, 1.0);
        let d = evaluate(record(1.0, T0), &p, T0 - 5_000, 1.0, true);

        assert_eq!(d.record.refilled_at_ms, T0);
        assert_eq!(d.record.count, 0.0);
    }

    #[test]
    fn test_lowered_capacity_clamps_stored_count() {
        let p = params(3.0, 1.0);
        let d = evaluate(record(10.0, T0), &p, T0, 1.0, true);
        assert_eq!(d.record.count, 2.0);
    }

    #[test]
    fn test_fractional_cost() {
        let p = params(2.0, 1.0);
        let d = evaluate(None, &p, T0, 0.75, true);
        assert_eq!(d.record.count, 1.25);
        assert_eq!(d.remaining(), 1);
        assert_eq!(d.resets_at_ms, T0 + 750);
    }

    #[test]
    fn test_decode_rejects_malformed_fields() {
        let mut fields = FieldMap::new();
        assert!(BucketRecord::decode(&fields, T0).is_none());

        fields.insert(COUNT_FIELD.to_string(), "three".to_string());
        fields.insert(REFILLED_AT_FIELD.to_string(), "1000".to_string());
        assert!(BucketRecord::decode(&fields, T0).is_none());

        fields.insert(COUNT_FIELD.to_string(), "-1".to_string());
        assert!(BucketRecord::decode(&fields, T0).is_none());

        fields.insert(COUNT_FIELD.to_string(), "2.5".to_string());
        assert_eq!(
            BucketRecord::decode(&fields, T0),
            Some(BucketRecord {
                count: 2.5,
                refilled_at_ms: 1000
            })
        );
    }

    #[test]
    fn test_decode_rejects_out_of_range_sync_points() {
        let mut fields = FieldMap::new();
        fields.insert(COUNT_FIELD.to_string(), "1".to_string());

        for bad in [i64::MIN, -1, i64::MAX, T0 + MAX_FUTURE_SKEW_MS + 1] {
            fields.insert(REFILLED_AT_FIELD.to_string(), bad.to_string());
            assert!(BucketRecord::decode(&fields, T0).is_none(), "{} accepted", bad);
        }

        // Modest skew between writers is tolerated.
        fields.insert(REFILLED_AT_FIELD.to_string(), (T0 + 5_000).to_string());
        assert!(BucketRecord::decode(&fields, T0).is_some());
    }

    #[test]
    fn test_extreme_records_do_not_overflow() {
        let p = params(5.0, 10.0);

        let d = evaluate(record(0.0, i64::MAX), &p, T0, 1.0, true);
        assert!(!d.allowed);
        assert_eq!(d.resets_at_ms, i64::MAX);
        assert_eq!(ttl_secs(i64::MAX, i64::MIN), (i64::MAX as u64).div_ceil(1000));
        assert_eq!(ttl_secs(i64::MIN, i64::MAX), 1);

        let d = evaluate(record(0.0, i64::MIN), &p, T0, 1.0, false);
        assert!(d.allowed);
        assert_eq!(d.record.count, 5.0);
    }

    #[test]
    fn test_encode_field_names() {
        let fields = BucketRecord {
            count: 4.0,
            refilled_at_ms: T0,
        }
        .encode("abc");

        let map: FieldMap = fields.into_iter().collect();
        assert_eq!(map.get("count").map(String::as_str), Some("4"));
        assert_eq!(map.get("refilled_at_ms").map(String::as_str), Some("1700000000000"));
        assert_eq!(map.get("version").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_snapshot_versions() {
        let absent = Snapshot::from_fields(None, T0);
        assert_eq!(absent.version, ABSENT_VERSION);
        assert!(!absent.malformed);

        let mut fields = FieldMap::new();
        fields.insert(VERSION_FIELD.to_string(), "v9".to_string());
        let broken = Snapshot::from_fields(Some(fields), T0);
        assert!(broken.record.is_none());
        assert!(broken.malformed);
        assert_eq!(broken.version, "v9");
    }

    #[test]
    fn test_ttl_rounds_up_to_whole_seconds() {
        assert_eq!(ttl_secs(T0 + 10_000, T0), 10);
        assert_eq!(ttl_secs(T0 + 10_001, T0), 11);
        assert_eq!(ttl_secs(T0 + 1, T0), 1);
        assert_eq!(ttl_secs(T0, T0), 1);
        assert_eq!(ttl_secs(T0 - 500, T0), 1);
    }
}
