use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use notify_relay::connection::ConnectionGuard;
use notify_relay::sink::{listener_sink, SinkReceiver};
use notify_relay::{sanitize_channel, ChannelRegistry, MemoryConnection, NotificationEnvelope};
use std::sync::Arc;

fn registry_with_listeners(
    runtime: &tokio::runtime::Runtime,
    listeners: usize,
) -> (ChannelRegistry, Vec<SinkReceiver>) {
    let (connection, _handle) = MemoryConnection::new();
    let registry = ChannelRegistry::new(Arc::new(ConnectionGuard::new(Box::new(connection))));
    let receivers = runtime.block_on(async {
        let mut receivers = Vec::with_capacity(listeners);
        for _ in 0..listeners {
            let (sink, receiver) = listener_sink("bench", 16);
            registry.subscribe("bench", sink).await.unwrap();
            receivers.push(receiver);
        }
        receivers
    });
    (registry, receivers)
}

fn benchmark_dispatch_fan_out(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("dispatch_fan_out");

    for listeners in [1usize, 10, 50] {
        let (registry, mut receivers) = registry_with_listeners(&runtime, listeners);
        group.bench_with_input(
            BenchmarkId::from_parameter(listeners),
            &listeners,
            |b, _| {
                b.iter(|| {
                    let delivered = registry.dispatch(black_box(NotificationEnvelope::new(
                        "bench",
                        r#"{"arg1":123}"#,
                        None,
                    )));
                    for receiver in receivers.iter_mut() {
                        receiver.try_recv();
                    }
                    delivered
                })
            },
        );
    }
    group.finish();
}

fn benchmark_sanitize(c: &mut Criterion) {
    c.bench_function("sanitize_channel", |b| {
        b.iter(|| sanitize_channel(black_box("orders.created:v2;DROP")))
    });
}

criterion_group!(benches, benchmark_dispatch_fan_out, benchmark_sanitize);
criterion_main!(benches);
