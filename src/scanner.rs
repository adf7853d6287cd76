/*!
    Discovery of the slaves on the bus, and reconciliation of the discovered topology with the slaves already known.

    A scan is done in two passes:

    1. the chain is walked by position with auto-incremented addressing, each answering slave is given its station address `station_base + position`
    2. each slave found is probed for its alias and identity, using its station address

    Positions not answering are reported as [Gap]s and the walk continues, so a silent slave in the middle of the chain does not hide the following ones.
*/

use std::collections::BTreeMap;
use core::fmt;
use log::*;

use crate::{
    registers,
    error::{EthercatError, EthercatResult, Fault, FaultKind},
    rawmaster::RawMaster,
    config::{ScanConfig, SlaveConfig, ExpectedSlave},
    sii::{Sii, SiiError, Identity},
    slave::{Slave, SlaveContext, SlaveInfo, SlaveState},
    };


/// a slave found by a scan
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Discovered {
    pub position: u16,
    /// station address assigned by the scan
    pub station: u16,
    pub alias: u16,
    pub identity: Identity,
}

/// a position of the chain where no slave could be probed
#[derive(Clone, Debug)]
pub struct Gap {
    pub position: u16,
    pub reason: Fault,
}

/// result of [scan]
#[derive(Clone, Debug, Default)]
pub struct ScanResult {
    /// number of slaves answering a broadcast
    pub responders: u16,
    /// slaves probed, by increasing position
    pub slaves: Vec<Discovered>,
    pub gaps: Vec<Gap>,
}
impl ScanResult {
    pub fn get(&self, position: u16) -> Option<&Discovered> {
        self.slaves.iter().find(|slave| slave.position == position)
    }
}

/**
    walk the chain and probe every slave found

    `expected` is a number of slaves the caller expects, positions below it are probed even when fewer slaves answer the broadcast, so missing slaves are reported as gaps.

    only a transport failure during the initial broadcast aborts the scan, any failure probing a position is reported as a gap
*/
pub async fn scan(raw: &RawMaster, config: &ScanConfig, slave: &SlaveConfig, expected: u16) -> EthercatResult<ScanResult> {
    let responders = raw.brd(registers::al::status).await?.answers;
    let expected = expected.max(config.expected_slaves);
    info!("scanning bus, {} slaves answering, {} expected", responders, expected);

    // first pass: assign station addresses
    let mut addressed = Vec::new();
    let mut gaps = Vec::new();
    let mut answered = 0;
    let mut position = 0;
    while position < config.max_positions && (answered < responders || position < expected) {
        let station = config.station_base.wrapping_add(position);
        let mut result = Err(EthercatError::Master("no probe done"));
        for attempt in 0 ..= config.probe_retries {
            if attempt != 0
                {debug!("retrying address of position {} ({}/{})", position, attempt, config.probe_retries);}
            result = async {raw.apwr(position, registers::address::fixed, station).await?.one()}.await;
            if result.is_ok()  {break}
        }
        match result {
            Ok(()) => {
                answered += 1;
                addressed.push((position, station));
            },
            Err(error) => {
                warn!("no slave answering at position {}: {}", position, error);
                gaps.push(Gap {position, reason: Fault::new(FaultKind::Topology, format!("no answer: {}", error))});
            },
        }
        position += 1;
    }

    // second pass: identify the slaves
    let mut slaves = Vec::new();
    for (position, station) in addressed {
        let mut result = Err(EthercatError::Master("no probe done"));
        for attempt in 0 ..= config.probe_retries {
            if attempt != 0
                {debug!("retrying probe of position {} ({}/{})", position, attempt, config.probe_retries);}
            result = probe(raw, config, slave, station).await;
            if result.is_ok()  {break}
        }
        match result {
            Ok((alias, identity)) => {
                debug!("slave {} at station {:#x}: {} alias {:#x}", position, station, identity, alias);
                slaves.push(Discovered {position, station, alias, identity});
            },
            Err(error) => {
                warn!("cannot probe slave at position {}: {}", position, error);
                gaps.push(Gap {position, reason: Fault::new(error.kind(), format!("identity probe failed: {}", error))});
            },
        }
    }
    gaps.sort_by_key(|gap| gap.position);
    info!("scan found {} slaves, {} gaps", slaves.len(), gaps.len());
    Ok(ScanResult {responders, slaves, gaps})
}

/// read the alias and identity of a slave
async fn probe(raw: &RawMaster, config: &ScanConfig, slave: &SlaveConfig, station: u16) -> EthercatResult<(u16, Identity), SiiError> {
    let sii = Sii::new(raw, station, slave.sii_timeout, slave.sii_assign_pdi);
    sii.acquire().await?;
    let (alias, identity) = sii.read_identity().await?;
    sii.release().await?;
    let alias = if config.alias_from_register
        {raw.fprd(station, registers::address::alias).await?.one()?}
        else {alias};
    Ok((alias, identity))
}


/// a slave which left the topology
#[derive(Clone, Debug)]
pub struct Removal {
    pub position: u16,
    pub identity: Identity,
    pub reason: Fault,
}

/// what changed between the previous topology and a scan
#[derive(Clone, Debug, Default)]
pub struct Reconciliation {
    /// positions where the same slave was found again
    pub kept: Vec<u16>,
    /// positions where a slave appeared
    pub added: Vec<u16>,
    /// positions where the slave identity changed
    pub replaced: Vec<u16>,
    pub removed: Vec<Removal>,
    /// positions of slaves not matching the expected identities
    pub mismatched: Vec<u16>,
}
impl Reconciliation {
    /// true when the topology is the same as before
    pub fn unchanged(&self) -> bool {
        self.added.is_empty() && self.replaced.is_empty() && self.removed.is_empty()
    }
}

/**
    merge a scan into the known slaves

    - a slave found again with the same identity keeps its [Slave], its state is refreshed from the bus
    - a new or changed slave gets a fresh [Slave], brought to [SlaveState::Init] (its EEPROM is read or taken from cache)
    - a slave no longer found is torn down: its process data region is released

    slaves not matching their [ExpectedSlave] are put in [SlaveState::Error]
*/
pub async fn reconcile(
    ctx: &SlaveContext<'_>,
    mut previous: BTreeMap<u16, Slave>,
    scan: &ScanResult,
    expected: &[ExpectedSlave],
) -> (BTreeMap<u16, Slave>, Reconciliation) {
    let mut slaves = BTreeMap::new();
    let mut report = Reconciliation::default();

    for found in &scan.slaves {
        let mut slave = match previous.remove(&found.position) {
            Some(mut known) if *known.identity() == found.identity && known.station() == found.station => {
                if let Err(error) = known.refresh(ctx).await {
                    known.fail(ctx, error.kind(), format!("cannot refresh state: {}", error));
                }
                report.kept.push(found.position);
                known
            },
            Some(known) => {
                info!("slave {} changed from {} to {}", found.position, known.identity(), found.identity);
                teardown(ctx, &known);
                report.replaced.push(found.position);
                report.removed.push(Removal {
                    position: found.position,
                    identity: *known.identity(),
                    reason: Fault::new(FaultKind::Topology, format!("replaced by {}", found.identity)),
                    });
                fresh(ctx, found).await
            },
            None => {
                info!("slave {} appeared: {}", found.position, found.identity);
                report.added.push(found.position);
                fresh(ctx, found).await
            },
        };
        if let Some(model) = expected.get(usize::from(found.position)) {
            if ! model.matches(&found.identity) {
                report.mismatched.push(found.position);
                if slave.state() != SlaveState::Error {
                    slave.fail(ctx, FaultKind::Topology, format!("unexpected device {}, expected {}", found.identity, ExpectedDisplay(model)));
                }
            }
        }
        slaves.insert(found.position, slave);
    }

    for (position, known) in previous {
        info!("slave {} disappeared: {}", position, known.identity());
        teardown(ctx, &known);
        let reason = scan.gaps.iter()
            .find(|gap| gap.position == position)
            .map(|gap| gap.reason.clone())
            .unwrap_or_else(|| Fault::new(FaultKind::Topology, "slave disappeared"));
        report.removed.push(Removal {position, identity: *known.identity(), reason});
    }
    (slaves, report)
}

/// a slave just discovered, brought to init state
async fn fresh(ctx: &SlaveContext<'_>, found: &Discovered) -> Slave {
    let mut slave = Slave::new(found.position, found.station, found.alias, found.identity);
    // errors are recorded in the slave diagnostics
    let _ = slave.step_up(ctx).await;
    slave
}

/// the cached EEPROM is kept, it is checked against the identity of any slave coming back at this place
fn teardown(ctx: &SlaveContext<'_>, slave: &Slave) {
    ctx.image.release(slave.position());
}

struct ExpectedDisplay<'a>(&'a ExpectedSlave);
impl fmt::Display for ExpectedDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let field = |f: &mut fmt::Formatter<'_>, value: Option<u32>| match value {
            Some(value) => write!(f, "{:#010x}", value),
            None => write!(f, "*"),
        };
        field(f, self.0.vendor)?;
        write!(f, ":")?;
        field(f, self.0.product)?;
        write!(f, " rev ")?;
        field(f, self.0.revision)?;
        write!(f, " serial ")?;
        field(f, self.0.serial)
    }
}


/// view of the bus topology as known by the master
#[derive(Clone, Debug, Default)]
pub struct TopologySnapshot {
    /// incremented at each scan
    pub generation: u64,
    /// number of slaves answering the last broadcast
    pub responders: u16,
    pub slaves: Vec<SlaveInfo>,
    pub gaps: Vec<Gap>,
    /// slaves removed by the last scan
    pub removed: Vec<Removal>,
}
impl TopologySnapshot {
    pub fn slave(&self, position: u16) -> Option<&SlaveInfo> {
        self.slaves.iter().find(|slave| slave.position == position)
    }
    /// number of slaves in [SlaveState::Operational]
    pub fn operational(&self) -> usize {
        self.slaves.iter().filter(|slave| slave.state == SlaveState::Operational).count()
    }
}
