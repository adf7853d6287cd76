mod common;

use std::sync::Arc;
use ethermaster::{
    config::{MasterConfig, RequiredSlaves, ExpectedSlave},
    registers::{AlState, AlError},
    socket::{SimulatedBus, SimulatedSlave, SlaveFault},
    EthercatError, FaultKind, MasterState, SlaveState, ReferenceClock, ClockSync,
    };
use common::*;


#[tokio::test]
async fn start_and_stop() {
    let bus = bus(3);
    let master = master(&bus, config());
    assert_eq!(master.master_state(), MasterState::Idle);
    assert!(matches!(master.cycle().await, Err(EthercatError::Master(_))));

    assert_eq!(master.start().await.unwrap(), MasterState::Operational);
    let topology = master.current_topology();
    assert_eq!(topology.generation, 1);
    assert_eq!(topology.responders, 3);
    assert_eq!(topology.operational(), 3);
    for (position, slave) in topology.slaves.iter().enumerate() {
        assert_eq!(slave.position, position as u16);
        assert_eq!(slave.identity.product, 0x100 + position as u32);
        assert_eq!(slave.name.as_deref(), Some("simulated slave"));
        assert_eq!(bus.al_state(slave.position), Some(AlState::Operational));
    }
    assert_eq!(master.process_image().regions().len(), 3);
}

#[tokio::test]
async fn required_slaves() {
    for (required, expected) in [
            (RequiredSlaves::All, MasterState::Degraded),
            (RequiredSlaves::AtLeast(2), MasterState::Operational),
            (RequiredSlaves::AtLeast(3), MasterState::Degraded),
            ] {
        let bus = bus(3);
        bus.fail_transition(1, AlState::SafeOperational, 0x1d);
        let master = master(&bus, MasterConfig {required, ..config()});
        assert_eq!(master.start().await.unwrap(), expected);

        let failed = master.slave(1).unwrap();
        assert_eq!(failed.state, SlaveState::Error);
        assert_eq!(failed.diagnostics.al_status, Some(AlError::InvalidOutputConfig));
        assert_eq!(failed.region, None);
        assert_eq!(master.slave(2).unwrap().state, SlaveState::Operational);

        // the other slaves exchange their process data
        let report = master.cycle().await.unwrap();
        assert_eq!(report.exchanged, [0, 2]);

        // a plain scan leaves the failed slave as is
        assert_eq!(master.request_scan().await.unwrap(), expected);
        assert_eq!(master.slave(1).unwrap().state, SlaveState::Error);

        assert_eq!(master.recover().await.unwrap(), MasterState::Operational);
        assert_eq!(master.slave(1).unwrap().state, SlaveState::Operational);
        let report = master.cycle().await.unwrap();
        assert_eq!(report.exchanged, [0, 1, 2]);
    }
}

#[tokio::test]
async fn unexpected_device() {
    let bus = bus(2);
    let config = MasterConfig {
        expected: vec![
            ExpectedSlave::model(VENDOR, 0x100),
            ExpectedSlave::model(VENDOR, 0x999),
            ],
        ..config()
    };
    let master = master(&bus, config);
    assert_eq!(master.start().await.unwrap(), MasterState::Degraded);
    let mismatch = master.slave(1).unwrap();
    assert_eq!(mismatch.state, SlaveState::Error);
    assert_eq!(mismatch.diagnostics.last_error.map(|fault| fault.kind), Some(FaultKind::Topology));
    assert_eq!(master.slave(0).unwrap().state, SlaveState::Operational);
}

#[tokio::test]
async fn missing_expected_slave() {
    let bus = bus(1);
    let config = MasterConfig {
        expected: vec![ExpectedSlave::any(), ExpectedSlave::any()],
        scan: ethermaster::config::ScanConfig {probe_retries: 0, ..Default::default()},
        ..config()
    };
    let master = master(&bus, config);
    assert_eq!(master.start().await.unwrap(), MasterState::Degraded);
    let topology = master.current_topology();
    assert_eq!(topology.gaps.len(), 1);
    assert_eq!(topology.gaps[0].position, 1);
    assert_eq!(topology.operational(), 1);
}

#[tokio::test]
async fn silent_slave() {
    let bus = bus(3);
    bus.set_fault(1, Some(SlaveFault::Silent));
    let master = master(&bus, config());
    assert_eq!(master.start().await.unwrap(), MasterState::Degraded);
    let topology = master.current_topology();
    assert_eq!(topology.gaps.iter().map(|gap| gap.position).collect::<Vec<_>>(), [1]);
    assert_eq!(topology.slave(2).unwrap().state, SlaveState::Operational);

    bus.set_fault(1, None);
    assert_eq!(master.recover().await.unwrap(), MasterState::Operational);
    assert_eq!(master.current_topology().operational(), 3);
}

#[tokio::test]
async fn link_broken_on_rescan() {
    let bus = bus(3);
    let master = master(&bus, config());
    assert_eq!(master.start().await.unwrap(), MasterState::Operational);

    bus.set_fault(1, Some(SlaveFault::LinkBroken));
    assert_eq!(master.request_scan().await.unwrap(), MasterState::Degraded);
    let topology = master.current_topology();
    assert_eq!(topology.responders, 1);
    assert_eq!(topology.slaves.len(), 1);
    let positions = |gaps: &[ethermaster::Gap]| gaps.iter().map(|gap| gap.position).collect::<Vec<_>>();
    assert_eq!(positions(&topology.gaps), [1, 2]);
    assert_eq!(topology.removed.iter().map(|removal| removal.position).collect::<Vec<_>>(), [1, 2]);

    // the lost positions are still walked by the next scans
    assert_eq!(master.request_scan().await.unwrap(), MasterState::Degraded);
    assert_eq!(positions(&master.current_topology().gaps), [1, 2]);

    bus.set_fault(1, None);
    assert_eq!(master.recover().await.unwrap(), MasterState::Operational);
    let topology = master.current_topology();
    assert!(topology.gaps.is_empty());
    assert_eq!(topology.operational(), 3);
}

#[tokio::test]
async fn eeprom_from_directory() {
    let model = SimulatedSlave::new(VENDOR, 0x300).serial(7);
    let identity = ethermaster::SiiImage::parse(model.eeprom()).unwrap().identity;
    let directory = std::env::temp_dir().join(format!("ethermaster-eeproms-{}", std::process::id()));
    std::fs::create_dir_all(&directory).unwrap();
    let overrides = ethermaster::DirectoryOverride::new(directory.clone());
    std::fs::write(overrides.path(&identity), model.eeprom()).unwrap();

    let bus = SimulatedBus::new();
    bus.push(model);
    let config = MasterConfig {
        slave: ethermaster::config::SlaveConfig {sii_directory: Some(directory.clone()), ..config().slave},
        ..config()
    };
    let master = master(&bus, config);
    assert_eq!(master.start().await.unwrap(), MasterState::Operational);
    let slave = master.slave(0).unwrap();
    assert_eq!(slave.diagnostics.sii_reads, 0);
    assert!(bus.take_sii_reads(0).iter().all(|&word| (4 .. 16).contains(&word)));
    assert_eq!(master.cache().len(), 1);
    std::fs::remove_dir_all(&directory).unwrap();
}

#[tokio::test]
async fn topology_change_detected() {
    let bus = bus(3);
    let master = master(&bus, config());
    master.start().await.unwrap();
    assert!(! master.topology_changed());

    bus.push(SimulatedSlave::new(VENDOR, 0x200));
    let report = master.cycle().await.unwrap();
    assert!(report.topology_changed);
    assert_eq!(report.responders, Some(4));
    assert!(master.topology_changed());
    // the new slave is only taken in by a scan
    assert_eq!(master.current_topology().slaves.len(), 3);

    assert_eq!(master.request_scan().await.unwrap(), MasterState::Operational);
    assert!(! master.topology_changed());
    let topology = master.current_topology();
    assert_eq!(topology.slaves.len(), 4);
    assert_eq!(topology.slave(3).unwrap().state, SlaveState::Operational);
    assert!(! master.cycle().await.unwrap().topology_changed);
}

#[tokio::test]
async fn reference_clock() {
    let bus = SimulatedBus::new();
    bus.push(SimulatedSlave::new(VENDOR, 0x100));
    bus.push(SimulatedSlave::new(VENDOR, 0x101).with_distributed_clock());
    bus.push(SimulatedSlave::new(VENDOR, 0x102).with_distributed_clock());
    let clock = Arc::new(ReferenceClock::new());
    let master = master(&bus, config()).with_clock(clock.clone());
    assert_eq!(master.start().await.unwrap(), MasterState::Operational);
    assert_eq!(clock.reference().map(|slave| slave.position), Some(1));
    // the drift compensation datagram is kept out of the mailbox space
    assert_eq!(clock.cycle_size(), 12 + 8);
    assert!(master.slave(1).unwrap().capabilities.distributed_clock);
    assert!(! master.slave(0).unwrap().capabilities.distributed_clock);

    let report = master.cycle().await.unwrap();
    assert!(report.faults.is_empty());
    assert_eq!(clock.syncs(), 1);

    // the reference is elected again when it leaves
    bus.remove(1);
    master.request_scan().await.unwrap();
    assert_eq!(clock.reference().map(|slave| slave.position), Some(1));
    assert_eq!(clock.reference().map(|slave| slave.station), Some(0x1001));
}

#[tokio::test]
async fn run_until_stopped() {
    let bus = bus(2);
    let master = Arc::new(master(&bus, config()));
    master.start().await.unwrap();
    master.process_image().write_outputs(0, &[0xab; 4]).unwrap();

    let runner = tokio::spawn({
        let master = master.clone();
        async move {master.run().await}
    });
    tokio::time::sleep(core::time::Duration::from_millis(50)).await;
    master.stop();
    runner.await.unwrap().unwrap();
    assert!(master.cyclic_stats().cycles > 0);
    assert_eq!(bus.outputs(0), [0xab; 4]);
}
