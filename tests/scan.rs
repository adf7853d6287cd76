mod common;

use ethermaster::{
    registers,
    config::{ScanConfig, SlaveConfig},
    socket::{SimulatedSlave, SlaveFault},
    scanner,
    FaultKind, Identity,
    };
use common::*;


#[tokio::test]
async fn stations_and_identities() {
    let bus = bus(3);
    bus.replace(1, SimulatedSlave::new(VENDOR, 0x101).revision(4).serial(77).alias(0x42));
    let (raw, _driver) = raw(&bus);

    let scan = scanner::scan(&raw, &ScanConfig::default(), &SlaveConfig::default(), 0).await.unwrap();
    assert_eq!(scan.responders, 3);
    assert!(scan.gaps.is_empty());
    assert_eq!(scan.slaves.len(), 3);
    for (position, found) in scan.slaves.iter().enumerate() {
        assert_eq!(found.position, position as u16);
        assert_eq!(found.station, 0x1000 + position as u16);
        assert_eq!(bus.station(position as u16), Some(found.station));
    }
    let second = scan.get(1).unwrap();
    assert_eq!(second.alias, 0x42);
    assert_eq!(second.identity, Identity {vendor: VENDOR, product: 0x101, revision: 4, serial: 77});
    // only the identity words are read during a scan
    assert!(bus.take_sii_reads(1).iter().all(|&word| (4 .. 16).contains(&word)));
}

#[tokio::test]
async fn silent_slave_is_a_gap() {
    let bus = bus(3);
    bus.set_fault(1, Some(SlaveFault::Silent));
    let (raw, _driver) = raw(&bus);

    let scan = scanner::scan(&raw, &ScanConfig::default(), &SlaveConfig::default(), 0).await.unwrap();
    assert_eq!(scan.responders, 2);
    assert_eq!(scan.gaps.len(), 1);
    assert_eq!(scan.gaps[0].position, 1);
    assert_eq!(scan.gaps[0].reason.kind, FaultKind::Topology);
    // the walk continued after the gap
    let positions = scan.slaves.iter().map(|slave| slave.position).collect::<Vec<_>>();
    assert_eq!(positions, [0, 2]);
    assert_eq!(scan.get(2).unwrap().identity.product, 0x102);
}

#[tokio::test]
async fn missing_expected_slaves() {
    let bus = bus(2);
    bus.set_fault(1, Some(SlaveFault::LinkBroken));
    let (raw, _driver) = raw(&bus);

    let config = ScanConfig {probe_retries: 0, ..Default::default()};
    let scan = scanner::scan(&raw, &config, &SlaveConfig::default(), 4).await.unwrap();
    assert_eq!(scan.responders, 1);
    assert_eq!(scan.slaves.len(), 1);
    let gaps = scan.gaps.iter().map(|gap| gap.position).collect::<Vec<_>>();
    assert_eq!(gaps, [1, 2, 3]);
}

#[tokio::test]
async fn alias_from_register() {
    let bus = bus(1);
    bus.replace(0, SimulatedSlave::new(VENDOR, 0x100).alias(0x11));
    let (raw, _driver) = raw(&bus);

    let scan = scanner::scan(&raw, &ScanConfig::default(), &SlaveConfig::default(), 0).await.unwrap();
    assert_eq!(scan.slaves[0].alias, 0x11);

    raw.fpwr(0x1000, registers::address::alias, 0x23).await.unwrap().one().unwrap();
    let config = ScanConfig {alias_from_register: true, ..Default::default()};
    let scan = scanner::scan(&raw, &config, &SlaveConfig::default(), 0).await.unwrap();
    assert_eq!(scan.slaves[0].alias, 0x23);
}

#[tokio::test]
async fn empty_bus() {
    let bus = bus(0);
    let (raw, _driver) = raw(&bus);
    let scan = scanner::scan(&raw, &ScanConfig::default(), &SlaveConfig::default(), 0).await.unwrap();
    assert_eq!(scan.responders, 0);
    assert!(scan.slaves.is_empty());
    assert!(scan.gaps.is_empty());
}
