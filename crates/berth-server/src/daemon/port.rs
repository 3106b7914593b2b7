use std::net::TcpListener;
use std::time::Duration;

use tracing::debug;

/// Whether a new listener could claim `host:port` right now.
pub fn is_port_bindable(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// Block until `host:port` is bindable, checking every `interval`. There is
/// no timeout; callers that need one must wrap this.
pub fn wait_until_bindable(host: &str, port: u16, interval: Duration) {
    let mut attempts = 0u64;
    while !is_port_bindable(host, port) {
        attempts += 1;
        debug!(host, port, attempts, "port still in use, waiting");
        std::thread::sleep(interval);
    }
}
