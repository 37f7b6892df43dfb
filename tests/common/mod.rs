#![allow(dead_code)]

pub mod strategies;
pub mod transport;

pub use strategies::*;
pub use transport::*;

use notify_relay::connection::MemoryConnectionHandle;
use notify_relay::{MemoryConnection, NotificationMultiplexer, RelayConfig};
use std::future::Future;
use std::time::Duration;

/// Default wait for asynchronous delivery in tests
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Test configuration: client publishing on, short readiness timeout
pub fn test_config() -> RelayConfig {
    RelayConfig::default()
        .with_client_publish(true)
        .with_read_timeout(Duration::from_millis(50))
        .with_bind_address("127.0.0.1:0")
}

/// Multiplexer running on an in-memory connection
pub fn memory_multiplexer(config: RelayConfig) -> (NotificationMultiplexer, MemoryConnectionHandle) {
    let (connection, handle) = MemoryConnection::new();
    let multiplexer = NotificationMultiplexer::with_connection(Box::new(connection), config)
        .expect("valid test configuration");
    (multiplexer, handle)
}

/// Poll `condition` until it holds or `timeout` expires
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `future`, failing the test if it takes longer than `DELIVERY_TIMEOUT`
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(DELIVERY_TIMEOUT, future)
        .await
        .expect("operation timed out")
}
