#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kms_leader::{ElectionConfig, ElectionController, InMemoryLeaseBackend, LeadershipCallbacks};

pub const LEASE_NAMESPACE: &str = "default";
pub const LEASE_NAME: &str = "integration-lease";

/// Short timings so a test run takes milliseconds, not seconds
pub fn fast_config(identity: &str) -> ElectionConfig {
    ElectionConfig::new(identity)
        .with_lease(LEASE_NAMESPACE, LEASE_NAME)
        .with_timings(Duration::from_millis(400), Duration::from_millis(150), Duration::from_millis(20))
        .with_release_timeout(Duration::from_secs(1))
}

pub fn controller(identity: &str, backend: &Arc<InMemoryLeaseBackend>) -> ElectionController {
    controller_with(identity, backend, LeadershipCallbacks::new())
}

pub fn controller_with(
    identity: &str,
    backend: &Arc<InMemoryLeaseBackend>,
    callbacks: LeadershipCallbacks,
) -> ElectionController {
    ElectionController::new(fast_config(identity), backend.clone(), callbacks).unwrap()
}

/// Poll `condition` until it holds, panicking after `within`
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(condition(), "condition not reached within {within:?}");
}
