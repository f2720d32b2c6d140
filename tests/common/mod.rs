//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use sensor_fleet::transport::TransportSettings;
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::time::{Duration, Instant};

/// Settings with a short poll interval and a private shared-memory directory
pub fn fast_settings(shm_dir: &Path) -> TransportSettings {
    TransportSettings {
        poll_interval: Duration::from_millis(5),
        shm_dir: shm_dir.to_path_buf(),
        ..TransportSettings::default()
    }
}

/// A loopback address nothing is listening on right now
pub fn free_local_addr() -> SocketAddr {
    let probe = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    probe.local_addr().expect("local addr")
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
