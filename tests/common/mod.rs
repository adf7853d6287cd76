#![allow(unused)]

use std::{sync::Arc, thread::JoinHandle};
use core::time::Duration;
use ethermaster::{
    socket::{SimulatedBus, SimulatedSlave},
    config::*,
    RawMaster, Master,
    };

pub const VENDOR: u32 = 0x2;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// settings making tests independent of the machine load
pub fn config() -> MasterConfig {
    MasterConfig {
        transport: TransportConfig {
            merge_time: Duration::from_micros(20),
            ..Default::default()
        },
        slave: SlaveConfig {
            transition_timeout: Duration::from_secs(1),
            ..Default::default()
        },
        cyclic: CyclicConfig {
            period: Duration::from_millis(5),
            deadline: Some(Duration::from_millis(200)),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// a bus of slaves with consecutive product codes starting at 0x100
pub fn bus(count: u32) -> SimulatedBus {
    let bus = SimulatedBus::new();
    for i in 0 .. count {
        bus.push(SimulatedSlave::new(VENDOR, 0x100 + i).serial(i + 1));
    }
    bus
}

pub fn master(bus: &SimulatedBus, config: MasterConfig) -> Master {
    init_logger();
    Master::new(bus.socket(), config)
}

/// raw master on the bus, with its driver running
pub fn raw(bus: &SimulatedBus) -> (Arc<RawMaster>, Driver) {
    init_logger();
    let raw = Arc::new(RawMaster::with_config(bus.socket(), &config().transport));
    let handle = raw.spawn_driver(false);
    (raw.clone(), Driver {raw, handle: Some(handle)})
}

/// stops the transport driver when dropped
pub struct Driver {
    raw: Arc<RawMaster>,
    handle: Option<JoinHandle<()>>,
}
impl Drop for Driver {
    fn drop(&mut self) {
        self.raw.stop();
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}
