use std::sync::atomic::{AtomicBool, Ordering};

use application::ServiceState;

/// 可在运行时切换的网络状态，代替真实的电话服务查询
#[derive(Debug)]
pub struct StaticServiceState {
    sim_ready: AtomicBool,
    network_registered: AtomicBool,
}

impl StaticServiceState {
    pub fn new(sim_ready: bool, network_registered: bool) -> Self {
        Self {
            sim_ready: AtomicBool::new(sim_ready),
            network_registered: AtomicBool::new(network_registered),
        }
    }

    pub fn ready() -> Self {
        Self::new(true, true)
    }

    pub fn set_sim_ready(&self, ready: bool) {
        self.sim_ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_network_registered(&self, registered: bool) {
        self.network_registered.store(registered, Ordering::SeqCst);
    }
}

impl Default for StaticServiceState {
    fn default() -> Self {
        Self::ready()
    }
}

impl ServiceState for StaticServiceState {
    fn sim_ready(&self) -> bool {
        self.sim_ready.load(Ordering::SeqCst)
    }

    fn network_registered(&self) -> bool {
        self.network_registered.load(Ordering::SeqCst)
    }
}
