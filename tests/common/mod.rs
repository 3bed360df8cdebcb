#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use umh_link::sim::SimulatedPorts;
use umh_link::PortOpener;

pub const WAIT: Duration = Duration::from_secs(2);

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

pub fn opener(ports: &Arc<SimulatedPorts>) -> Arc<dyn PortOpener> {
    Arc::clone(ports) as Arc<dyn PortOpener>
}
