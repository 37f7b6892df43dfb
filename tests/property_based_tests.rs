mod common;

use common::strategies::*;
use notify_relay::connection::ConnectionGuard;
use notify_relay::sink::listener_sink;
use notify_relay::{sanitize_channel, ChannelRegistry, MemoryConnection};
use proptest::prelude::*;
use std::sync::Arc;

proptest! {
    /// Sanitizing twice changes nothing
    #[test]
    fn sanitize_is_idempotent(name in raw_channel_strategy()) {
        let once = sanitize_channel(&name);
        prop_assert_eq!(sanitize_channel(&once), once);
    }

    /// Sanitized names only contain identifier characters, in their original order
    #[test]
    fn sanitize_keeps_an_ordered_subset(name in raw_channel_strategy()) {
        let sanitized = sanitize_channel(&name);
        prop_assert!(sanitized.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));

        let mut remaining = name.chars();
        for c in sanitized.chars() {
            prop_assert!(remaining.any(|r| r == c), "{:?} is not a subsequence of {:?}", sanitized, name);
        }
    }

    /// LISTEN and UNLISTEN are issued exactly on 0->1 and 1->0 transitions
    #[test]
    fn listen_unlisten_follow_listener_transitions(ops in registry_ops_strategy(3)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let (connection, conn) = MemoryConnection::new();
            let guard = Arc::new(ConnectionGuard::new(Box::new(connection)));
            let registry = ChannelRegistry::new(guard);

            let channels = ["alpha", "beta", "gamma"];
            let mut live = Vec::new();
            let mut receivers = Vec::new();
            let mut counts = [0usize; 3];
            let mut expected_listens = [0usize; 3];
            let mut expected_unlistens = [0usize; 3];

            for op in ops {
                match op {
                    RegistryOp::Subscribe(idx) => {
                        let (sink, receiver) = listener_sink(channels[idx], 4);
                        let handle = registry.subscribe(channels[idx], sink).await.unwrap();
                        receivers.push(receiver);
                        live.push((idx, handle));
                        if counts[idx] == 0 {
                            expected_listens[idx] += 1;
                        }
                        counts[idx] += 1;
                    }
                    RegistryOp::Unsubscribe(pos) => {
                        if live.is_empty() {
                            continue;
                        }
                        let (idx, handle) = live.remove(pos % live.len());
                        registry.unsubscribe(&handle).await.unwrap();
                        counts[idx] -= 1;
                        if counts[idx] == 0 {
                            expected_unlistens[idx] += 1;
                        }
                    }
                }
            }

            for (idx, channel) in channels.iter().enumerate() {
                assert_eq!(conn.listen_count(channel), expected_listens[idx]);
                assert_eq!(conn.unlisten_count(channel), expected_unlistens[idx]);
                assert_eq!(registry.listener_count(channel), counts[idx]);
                assert_eq!(conn.is_listening(channel), counts[idx] > 0);
            }
        });
    }
}
