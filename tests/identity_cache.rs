mod common;

use ethermaster::{
    socket::{SimulatedSlave, SlaveFault},
    FaultKind, MasterState, SlaveState,
    };
use common::*;


/// true if only the identity words of the EEPROM were read
fn identity_only(reads: &[u16]) -> bool {
    reads.iter().all(|&word| (4 .. 16).contains(&word))
}

#[tokio::test]
async fn rescan_unchanged() {
    let bus = bus(3);
    let master = master(&bus, config());
    assert_eq!(master.start().await.unwrap(), MasterState::Operational);
    for position in 0 .. 3 {
        assert!(! identity_only(&bus.take_sii_reads(position)));
        assert_eq!(master.slave(position).unwrap().diagnostics.sii_reads, 1);
    }
    assert_eq!(master.cache().len(), 3);

    assert_eq!(master.request_scan().await.unwrap(), MasterState::Operational);
    let topology = master.current_topology();
    assert_eq!(topology.generation, 2);
    assert!(topology.removed.is_empty());
    for position in 0 .. 3 {
        assert!(identity_only(&bus.take_sii_reads(position)));
        let slave = topology.slave(position).unwrap();
        assert_eq!(slave.state, SlaveState::Operational);
        // the same slave was kept
        assert_eq!(slave.diagnostics.transitions, 4);
    }
}

#[tokio::test]
async fn slave_coming_back() {
    let bus = bus(3);
    let master = master(&bus, config());
    master.start().await.unwrap();
    for position in 0 .. 3 {
        bus.take_sii_reads(position);
    }

    bus.set_fault(1, Some(SlaveFault::LinkBroken));
    master.request_scan().await.unwrap();
    let topology = master.current_topology();
    assert_eq!(topology.responders, 1);
    assert_eq!(topology.slaves.len(), 1);
    let removed = topology.removed.iter().map(|removal| removal.position).collect::<Vec<_>>();
    assert_eq!(removed, [1, 2]);
    assert!(topology.removed.iter().all(|removal| removal.reason.kind == FaultKind::Topology));
    assert_eq!(topology.removed[0].identity.product, 0x101);
    assert_eq!(master.process_image().region(1), None);

    bus.set_fault(1, None);
    let hits = master.cache().stats().hits;
    assert_eq!(master.request_scan().await.unwrap(), MasterState::Operational);
    let topology = master.current_topology();
    assert_eq!(topology.slaves.len(), 3);
    assert_eq!(topology.operational(), 3);
    for position in 1 .. 3 {
        // the eeprom comes from the cache
        assert!(identity_only(&bus.take_sii_reads(position)));
        assert_eq!(topology.slave(position).unwrap().diagnostics.sii_reads, 0);
    }
    assert_eq!(master.cache().stats().hits, hits + 2);
}

#[tokio::test]
async fn replaced_slave() {
    let bus = bus(3);
    let master = master(&bus, config());
    master.start().await.unwrap();
    bus.take_sii_reads(1);

    bus.replace(1, SimulatedSlave::new(VENDOR, 0x101).serial(42));
    assert_eq!(master.request_scan().await.unwrap(), MasterState::Operational);
    let topology = master.current_topology();
    assert_eq!(topology.removed.len(), 1);
    assert_eq!(topology.removed[0].position, 1);
    assert_eq!(topology.removed[0].identity.serial, 2);

    let replaced = topology.slave(1).unwrap();
    assert_eq!(replaced.identity.serial, 42);
    assert_eq!(replaced.state, SlaveState::Operational);
    assert_eq!(replaced.diagnostics.sii_reads, 1);
    assert!(! identity_only(&bus.take_sii_reads(1)));
    assert_eq!(master.cache().stats().invalidations, 1);
}
