mod common;

use ethermaster::{
    socket::{SimulatedBus, SimulatedSlave},
    FaultKind, MailboxType, MasterState, SlaveState,
    };
use common::*;


#[tokio::test]
async fn process_data() {
    let bus = SimulatedBus::new();
    bus.push(SimulatedSlave::new(VENDOR, 0x100).serial(1));
    bus.push(SimulatedSlave::new(VENDOR, 0x101).serial(2).process(2, 6));
    let master = master(&bus, config());
    assert_eq!(master.start().await.unwrap(), MasterState::Operational);

    let image = master.process_image();
    image.write_outputs(0, &[1, 2, 3, 4]).unwrap();
    image.write_outputs(1, &[5, 6]).unwrap();
    assert!(image.write_outputs(1, &[5, 6, 7]).is_err());
    bus.set_inputs(0, &[10, 11, 12, 13]);
    bus.set_inputs(1, &[20, 21, 22, 23, 24, 25]);

    let report = master.cycle().await.unwrap();
    assert_eq!(report.exchanged, [0, 1]);
    assert!(report.missed.is_empty());
    assert_eq!(report.responders, Some(2));
    assert!(! report.topology_changed);
    assert!(report.faults.is_empty());

    assert_eq!(bus.outputs(0), [1, 2, 3, 4]);
    assert_eq!(bus.outputs(1), [5, 6]);
    assert_eq!(image.inputs(0).unwrap(), [10, 11, 12, 13]);
    assert_eq!(image.inputs(1).unwrap(), [20, 21, 22, 23, 24, 25]);
    assert_eq!(master.cyclic_stats().cycles, 1);
}

#[tokio::test]
async fn without_logical_exchange() {
    let bus = SimulatedBus::new();
    bus.push(SimulatedSlave::new(VENDOR, 0x100).without_logical_exchange());
    let master = master(&bus, config());
    assert_eq!(master.start().await.unwrap(), MasterState::Operational);
    assert!(! master.slave(0).unwrap().capabilities.logical_exchange);

    master.process_image().write_outputs(0, &[9, 8, 7, 6]).unwrap();
    bus.set_inputs(0, &[1, 3, 5, 7]);
    let report = master.cycle().await.unwrap();
    assert_eq!(report.exchanged, [0]);
    assert_eq!(bus.outputs(0), [9, 8, 7, 6]);
    assert_eq!(master.process_image().inputs(0).unwrap(), [1, 3, 5, 7]);
}

#[tokio::test]
async fn watchdog_and_quick_recovery() {
    let bus = bus(2);
    let master = master(&bus, config());
    assert_eq!(master.start().await.unwrap(), MasterState::Operational);
    let threshold = master.config().cyclic.watchdog_threshold;

    bus.miss_exchanges(1, threshold);
    for _ in 1 .. threshold {
        let report = master.cycle().await.unwrap();
        assert_eq!(report.exchanged, [0]);
        assert_eq!(report.missed, [1]);
        assert!(report.dropped.is_empty());
    }
    let report = master.cycle().await.unwrap();
    assert_eq!(report.dropped, [1]);
    let dropped = master.slave(1).unwrap();
    assert_eq!(dropped.state, SlaveState::SafeOperational);
    assert_eq!(dropped.diagnostics.last_error.map(|fault| fault.kind), Some(FaultKind::WatchdogExpired));
    assert_eq!(master.master_state(), MasterState::Degraded);

    // a dropped slave is no longer exchanged
    let report = master.cycle().await.unwrap();
    assert_eq!(report.exchanged, [0]);
    assert!(report.missed.is_empty());

    assert_eq!(master.maintain().await, 1);
    let recovered = master.slave(1).unwrap();
    assert_eq!(recovered.state, SlaveState::Operational);
    assert_eq!(recovered.diagnostics.quick_ops, 1);
    let report = master.cycle().await.unwrap();
    assert_eq!(report.exchanged, [0, 1]);
    assert_eq!(master.cyclic_stats().watchdog_expiries, 1);
    // cycles never promote a degraded master
    assert_eq!(master.master_state(), MasterState::Degraded);
    assert_eq!(master.recover().await.unwrap(), MasterState::Operational);
}

#[tokio::test]
async fn mailbox_exchange() {
    let bus = bus(1);
    let master = master(&bus, config());
    master.start().await.unwrap();

    let ticket = master.mailbox_post(0, MailboxType::Can, vec![1, 2, 3, 4]);
    assert!(master.mailbox_take(ticket).is_none());
    let mut answer = None;
    for _ in 0 .. 10 {
        let report = master.cycle().await.unwrap();
        assert_eq!(report.exchanged, [0]);
        answer = master.mailbox_take(ticket);
        if answer.is_some()  {break}
    }
    // the simulated slave echoes the request
    assert_eq!(answer.unwrap().unwrap(), [1, 2, 3, 4]);
    assert!(master.mailbox_take(ticket).is_none());

    // requests to a slave not on the bus wait until their timeout
    let ticket = master.mailbox_post(5, MailboxType::Can, vec![0]);
    master.cycle().await.unwrap();
    assert!(master.mailbox_take(ticket).is_none());
}

#[tokio::test]
async fn transport_down() {
    let bus = bus(2);
    let master = master(&bus, config());
    assert_eq!(master.start().await.unwrap(), MasterState::Operational);

    bus.set_transport_down(true);
    let link_down = |report: &ethermaster::CycleReport| report.faults.iter().any(|fault| fault.kind == FaultKind::Transport);
    let mut report = master.cycle().await.unwrap();
    for _ in 0 .. 20 {
        if link_down(&report)  {break}
        report = master.cycle().await.unwrap();
    }
    assert!(link_down(&report));
    assert_eq!(master.master_state(), MasterState::Degraded);
    assert_eq!(report.responders, None);
    assert!(report.exchanged.is_empty());

    bus.set_transport_down(false);
    assert_eq!(master.recover().await.unwrap(), MasterState::Operational);
    let report = master.cycle().await.unwrap();
    assert_eq!(report.exchanged, [0, 1]);
}
