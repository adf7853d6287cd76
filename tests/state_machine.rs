mod common;

use ethermaster::{
    config::{ScanConfig, SlaveConfig, LogicalConfig},
    registers::{AlState, AlError},
    socket::{SimulatedBus, SimulatedSlave, SlaveFault},
    scanner,
    sii::SiiError,
    EthercatError, FaultKind, Slave, SlaveState, SlaveError,
    SiiCache, ProcessImage, FreeRun, RawMaster,
    slave::SlaveContext,
    };
use common::*;


/// slaves discovered on the bus, not yet initialized
async fn discover(raw: &RawMaster) -> Vec<Slave> {
    scanner::scan(raw, &ScanConfig::default(), &SlaveConfig::default(), 0).await.unwrap()
        .slaves.iter()
        .map(|found| Slave::new(found.position, found.station, found.alias, found.identity))
        .collect()
}

fn slave_config() -> SlaveConfig {
    SlaveConfig {
        transition_timeout: core::time::Duration::from_secs(1),
        ..Default::default()
    }
}

#[tokio::test]
async fn drive_to_operational() {
    let bus = bus(2);
    let (raw, _driver) = raw(&bus);
    let (config, cache, image) = (slave_config(), SiiCache::new(), ProcessImage::new(&LogicalConfig::default()));
    let ctx = SlaveContext {raw: &raw, config: &config, cache: &cache, overrides: None, image: &image, clock: &FreeRun};

    for mut slave in discover(&raw).await {
        assert_eq!(slave.state(), SlaveState::Unknown);
        assert_eq!(slave.step_up(&ctx).await.unwrap(), SlaveState::Init);
        assert!(slave.sii().is_some());
        assert!(slave.capabilities().mailbox.is_some());
        assert!(slave.capabilities().logical_exchange);
        assert_eq!(slave.layout().outputs_size(), 4);
        assert_eq!(slave.layout().inputs_size(), 4);

        assert_eq!(slave.drive(&ctx, SlaveState::Operational).await.unwrap(), 3);
        assert_eq!(slave.state(), SlaveState::Operational);
        assert_eq!(bus.al_state(slave.position()), Some(AlState::Operational));
        assert_eq!(slave.diagnostics().transitions, 4);
        assert_eq!(slave.diagnostics().sii_reads, 1);
        let region = slave.region().unwrap();
        assert_eq!((region.outputs, region.inputs), (4, 4));
        assert_eq!(image.region(slave.position()), Some(region));

        // already there
        assert_eq!(slave.drive(&ctx, SlaveState::PreOperational).await.unwrap(), 0);
        assert!(slave.drive(&ctx, SlaveState::Error).await.is_err());
    }
    let regions = image.regions();
    assert_eq!(regions.len(), 2);
    assert_ne!(regions[0].1.logical, regions[1].1.logical);
}

#[tokio::test]
async fn refused_transition() {
    let bus = bus(1);
    bus.fail_transition(0, AlState::SafeOperational, 0x1d);
    let (raw, _driver) = raw(&bus);
    let (config, cache, image) = (slave_config(), SiiCache::new(), ProcessImage::new(&LogicalConfig::default()));
    let ctx = SlaveContext {raw: &raw, config: &config, cache: &cache, overrides: None, image: &image, clock: &FreeRun};
    let mut slave = discover(&raw).await.remove(0);

    let error = slave.drive(&ctx, SlaveState::Operational).await.unwrap_err();
    assert!(matches!(error, EthercatError::Slave(SlaveError::Refused {
        state: AlState::SafeOperational,
        code: AlError::InvalidOutputConfig,
        })));
    assert_eq!(slave.state(), SlaveState::Error);
    assert_eq!(slave.requested(), SlaveState::SafeOperational);
    assert_eq!(slave.diagnostics().al_status, Some(AlError::InvalidOutputConfig));
    assert_eq!(slave.diagnostics().last_error.as_ref().map(|fault| fault.kind), Some(FaultKind::SlaveConfiguration));
    assert!(slave.needs_recovery());
    // no process data for a failed slave
    assert_eq!(slave.region(), None);
    assert_eq!(image.region(0), None);
    assert_eq!(bus.al_error(0), Some(0x1d));

    // stuck until reset
    assert!(matches!(slave.step_up(&ctx).await, Err(EthercatError::Slave(SlaveError::Stalled))));
    assert!(matches!(slave.drive(&ctx, SlaveState::Operational).await, Err(EthercatError::Slave(SlaveError::Stalled))));

    slave.reset(&ctx).await.unwrap();
    assert_eq!(slave.state(), SlaveState::Init);
    assert_eq!(bus.al_error(0), None);
    assert_eq!(slave.drive(&ctx, SlaveState::Operational).await.unwrap(), 3);
    assert_eq!(bus.al_state(0), Some(AlState::Operational));
    // the eeprom was kept across the reset
    assert_eq!(slave.diagnostics().sii_reads, 1);
}

#[tokio::test]
async fn refresh_follows_the_slave() {
    let bus = bus(1);
    let (raw, _driver) = raw(&bus);
    let (config, cache, image) = (slave_config(), SiiCache::new(), ProcessImage::new(&LogicalConfig::default()));
    let ctx = SlaveContext {raw: &raw, config: &config, cache: &cache, overrides: None, image: &image, clock: &FreeRun};
    let mut slave = discover(&raw).await.remove(0);
    slave.drive(&ctx, SlaveState::Operational).await.unwrap();
    assert_eq!(slave.refresh(&ctx).await.unwrap(), SlaveState::Operational);

    // the slave went back to init on its own
    raw.fpwr(slave.station(), ethermaster::registers::al::control,
        ethermaster::registers::AlControlRequest::switch(AlState::Init)).await.unwrap().one().unwrap();
    assert_eq!(slave.refresh(&ctx).await.unwrap(), SlaveState::Init);
    assert_eq!(slave.region(), None);
    assert_eq!(image.region(0), None);
}

#[tokio::test]
async fn eeprom_from_cache() {
    let bus = SimulatedBus::new();
    bus.push(SimulatedSlave::new(VENDOR, 0x200).serial(9).alias(0x30));
    let (raw, _driver) = raw(&bus);
    let (config, cache, image) = (slave_config(), SiiCache::new(), ProcessImage::new(&LogicalConfig::default()));
    let ctx = SlaveContext {raw: &raw, config: &config, cache: &cache, overrides: None, image: &image, clock: &FreeRun};

    let mut first = discover(&raw).await.remove(0);
    first.step_up(&ctx).await.unwrap();
    assert_eq!(first.diagnostics().sii_reads, 1);
    assert_eq!(cache.len(), 1);
    bus.take_sii_reads(0);

    let mut second = discover(&raw).await.remove(0);
    second.step_up(&ctx).await.unwrap();
    assert_eq!(second.diagnostics().sii_reads, 0);
    assert!(bus.take_sii_reads(0).iter().all(|&word| (4 .. 16).contains(&word)));
    assert_eq!(cache.stats().hits, 1);

    // without cache, the eeprom is read again
    let config = SlaveConfig {sii_cache: false, ..slave_config()};
    let ctx = SlaveContext {config: &config, ..ctx};
    let mut third = discover(&raw).await.remove(0);
    third.step_up(&ctx).await.unwrap();
    assert_eq!(third.diagnostics().sii_reads, 1);
}

#[tokio::test]
async fn refused_at_every_state() {
    for (state, code, error) in [
            (AlState::Init, 0x01, AlError::Unspecified),
            (AlState::PreOperational, 0x16, AlError::InvalidMailboxConfigPreop),
            (AlState::Operational, 0x1b, AlError::SyncWatchdog),
            ] {
        let bus = bus(1);
        bus.fail_transition(0, state, code);
        let (raw, _driver) = raw(&bus);
        let (config, cache, image) = (slave_config(), SiiCache::new(), ProcessImage::new(&LogicalConfig::default()));
        let ctx = SlaveContext {raw: &raw, config: &config, cache: &cache, overrides: None, image: &image, clock: &FreeRun};
        let mut slave = discover(&raw).await.remove(0);

        let result = slave.drive(&ctx, SlaveState::Operational).await;
        assert!(matches!(result, Err(EthercatError::Slave(SlaveError::Refused {state: refused, code: reported}))
            if refused == state && reported == error));
        assert_eq!(slave.state(), SlaveState::Error);
        assert_eq!(slave.diagnostics().al_status, Some(error));
        assert_eq!(slave.region(), None);
        assert_eq!(image.region(0), None);

        slave.reset(&ctx).await.unwrap();
        assert_eq!(slave.state(), SlaveState::Init);
        assert_eq!(slave.drive(&ctx, SlaveState::Operational).await.unwrap(), 3);
        assert_eq!(bus.al_state(0), Some(AlState::Operational));
        assert_eq!(slave.diagnostics().sii_reads, 1);
    }
}

#[tokio::test]
async fn transition_timeout() {
    let bus = bus(1);
    let (raw, _driver) = raw(&bus);
    let config = SlaveConfig {
        transition_timeout: core::time::Duration::from_millis(50),
        ..slave_config()
    };
    let (cache, image) = (SiiCache::new(), ProcessImage::new(&LogicalConfig::default()));
    let ctx = SlaveContext {raw: &raw, config: &config, cache: &cache, overrides: None, image: &image, clock: &FreeRun};
    let mut slave = discover(&raw).await.remove(0);
    assert_eq!(slave.step_up(&ctx).await.unwrap(), SlaveState::Init);

    // the slave never reaches the requested state
    bus.set_fault(0, Some(SlaveFault::StateStuck));
    let result = slave.step_up(&ctx).await;
    assert!(matches!(result, Err(EthercatError::Timeout(_))));
    assert_eq!(slave.state(), SlaveState::Error);
    assert_eq!(slave.diagnostics().last_error.as_ref().map(|fault| fault.kind), Some(FaultKind::DatagramTimeout));
    assert_eq!(bus.al_state(0), Some(AlState::Init));

    bus.set_fault(0, None);
    slave.reset(&ctx).await.unwrap();
    assert_eq!(slave.drive(&ctx, SlaveState::Operational).await.unwrap(), 3);
}

#[tokio::test]
async fn eeprom_retries_exhausted() {
    let bus = bus(3);
    let (raw, _driver) = raw(&bus);
    let config = SlaveConfig {config_retries: 2, ..slave_config()};
    let (cache, image) = (SiiCache::new(), ProcessImage::new(&LogicalConfig::default()));
    let ctx = SlaveContext {raw: &raw, config: &config, cache: &cache, overrides: None, image: &image, clock: &FreeRun};
    let mut slaves = discover(&raw).await;
    assert_eq!(slaves.len(), 3);

    bus.set_fault(1, Some(SlaveFault::EepromFailure));
    for slave in slaves.iter_mut() {
        let result = slave.drive(&ctx, SlaveState::Operational).await;
        if slave.position() == 1 {
            assert!(matches!(result, Err(EthercatError::Slave(SlaveError::Sii(SiiError::Command)))));
        }
        else {
            assert_eq!(result.unwrap(), 4);
        }
    }
    let stalled = &slaves[1];
    assert_eq!(stalled.state(), SlaveState::Error);
    assert_eq!(stalled.diagnostics().retries, 2);
    assert_eq!(stalled.diagnostics().sii_reads, 0);
    assert!(stalled.sii().is_none());
    assert_eq!(image.region(1), None);
    // the others do not depend on it
    assert_eq!(slaves[0].state(), SlaveState::Operational);
    assert_eq!(slaves[2].state(), SlaveState::Operational);
    assert_eq!(image.regions().len(), 2);
}
