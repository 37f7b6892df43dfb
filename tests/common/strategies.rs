//! Proptest strategies

use proptest::prelude::*;

/// Arbitrary client-supplied channel names, including punctuation and
/// non-ASCII characters
pub fn raw_channel_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[A-Za-z0-9_]{1,16}",
        "[A-Za-z0-9_ .:;!@#$%^&*()\\-\"']{0,24}",
        any::<String>(),
    ]
}

/// One registry operation on a small set of channels
#[derive(Debug, Clone)]
pub enum RegistryOp {
    /// Subscribe a new sink to channel `n`
    Subscribe(usize),
    /// Unsubscribe the live subscription at this position (modulo count)
    Unsubscribe(usize),
}

pub fn registry_ops_strategy(channels: usize) -> impl Strategy<Value = Vec<RegistryOp>> {
    prop::collection::vec(
        prop_oneof![
            (0..channels).prop_map(RegistryOp::Subscribe),
            any::<usize>().prop_map(RegistryOp::Unsubscribe),
        ],
        1..40,
    )
}
