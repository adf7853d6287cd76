/*!
    Master coordinator: owns the slaves and every shared resource, and arbitrates between the bus scans, the slave configurations and the cyclic exchanges.
*/

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    sync::atomic::{AtomicBool, Ordering::*},
    thread::JoinHandle,
    };
use core::fmt;
use futures::stream::StreamExt;
use log::*;

use crate::{
    error::{EthercatError, EthercatResult},
    socket::EthercatSocket,
    rawmaster::RawMaster,
    queue::Latency,
    config::{MasterConfig, RequiredSlaves},
    cache::{SiiCache, SiiOverride, DirectoryOverride},
    mapping::ProcessImage,
    mailbox::{MailboxType, MailboxError, Ticket},
    clock::{ClockSync, FreeRun},
    slave::{Slave, SlaveContext, SlaveInfo, SlaveState},
    scanner::{self, Gap, Removal, Reconciliation, TopologySnapshot},
    cyclic::{CyclicEngine, CycleReport, CyclicStats},
    };


/// run state of the [Master]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MasterState {
    /// not started yet
    Idle,
    /// walking the bus
    Scanning,
    /// bringing slaves to operational state
    ConfiguringSlaves,
    /// enough slaves are exchanging process data
    Operational,
    /// cycles are running but too few slaves are operational, or the link is down
    Degraded,
}
impl fmt::Display for MasterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// slaves as known since the last scan, only accessed by the phase holding the lock
#[derive(Default)]
struct Topology {
    slaves: BTreeMap<u16, Slave>,
    /// slaves answering a broadcast at the last scan
    responders: u16,
    gaps: Vec<Gap>,
    removed: Vec<Removal>,
    generation: u64,
}

/**
    EtherCAT master running the slaves state machines and the cyclic process data exchange.

    Scans and slave configurations on one side, cycles on the other side, are serialized by a lock on the topology: a cycle never waits for this lock, it is simply skipped while a scan is running.

    ## Example

    ```ignore
    let master = Master::new(EthernetSocket::new("eno1")?, MasterConfig::default());
    master.start().await?;
    master.process_image().write_outputs(0, &[1, 2])?;
    loop {
        master.cycle().await?;
        master.maintain().await;
    }
    ```
*/
pub struct Master {
    raw: Arc<RawMaster>,
    driver: Mutex<Option<JoinHandle<()>>>,
    config: MasterConfig,
    cache: SiiCache,
    overrides: Option<Box<dyn SiiOverride>>,
    clock: Arc<dyn ClockSync>,
    image: ProcessImage,
    engine: CyclicEngine,

    topology: tokio::sync::Mutex<Topology>,
    state: Mutex<MasterState>,
    snapshot: Mutex<TopologySnapshot>,
    topology_changed: AtomicBool,
    stopped: AtomicBool,
}

impl Master {
    /// initialize a master on the given socket, and start its transport driver thread
    pub fn new<S: EthercatSocket + 'static + Send + Sync>(socket: S, config: MasterConfig) -> Self {
        let raw = Arc::new(RawMaster::with_config(socket, &config.transport));
        let driver = raw.spawn_driver(config.transport.realtime);
        let master = Self::from_raw(raw, config);
        *master.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(driver);
        master
    }
    /// build a master on a raw master whose transport driver is run by the caller
    pub fn from_raw(raw: Arc<RawMaster>, config: MasterConfig) -> Self {
        let overrides = config.slave.sii_directory.as_ref().map(|directory| {
            info!("eeprom overrides from {}", directory.display());
            Box::new(DirectoryOverride::new(directory.clone())) as Box<dyn SiiOverride>
        });
        Self {
            raw,
            driver: Mutex::new(None),
            cache: SiiCache::new(),
            overrides,
            clock: Arc::new(FreeRun),
            image: ProcessImage::new(&config.logical),
            engine: CyclicEngine::new(config.cyclic.clone()),
            config,

            topology: tokio::sync::Mutex::new(Topology::default()),
            state: Mutex::new(MasterState::Idle),
            snapshot: Mutex::new(TopologySnapshot::default()),
            topology_changed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }
    /// use the given clock synchronization step instead of letting slaves run freely
    pub fn with_clock(mut self, clock: Arc<dyn ClockSync>) -> Self {
        self.clock = clock;
        self
    }
    /// take EEPROM images from the given source instead of reading them on the slaves when available
    pub fn with_override(mut self, overrides: impl SiiOverride + 'static) -> Self {
        self.overrides = Some(Box::new(overrides));
        self
    }

    /**
        return a reference to the low level master control.

        This method is marked unsafe since letting the user write registers may break the slaves configuration done by this master.
    */
    pub unsafe fn get_raw(&self) -> &Arc<RawMaster>  {&self.raw}
    pub fn config(&self) -> &MasterConfig  {&self.config}
    /// cache of EEPROM images, kept for the lifetime of the master
    pub fn cache(&self) -> &SiiCache  {&self.cache}
    /// process data of all operational slaves
    pub fn process_image(&self) -> &ProcessImage  {&self.image}
    pub fn latency(&self) -> Latency  {self.raw.latency()}
    pub fn cyclic_stats(&self) -> CyclicStats  {self.engine.stats()}

    fn state_lock(&self) -> MutexGuard<'_, MasterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
    fn snapshot_lock(&self) -> MutexGuard<'_, TopologySnapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }
    pub fn master_state(&self) -> MasterState  {*self.state_lock()}
    fn set_state(&self, state: MasterState) {
        let mut current = self.state_lock();
        if *current != state {
            info!("master {} -> {}", *current, state);
            *current = state;
        }
    }
    /// topology as known after the last scan, with the slave states as of the last cycle
    pub fn current_topology(&self) -> TopologySnapshot  {self.snapshot_lock().clone()}
    /// state and diagnostics of a slave
    pub fn slave(&self, position: u16) -> Option<SlaveInfo> {
        self.snapshot_lock().slave(position).cloned()
    }
    /// a cycle noticed a different number of slaves on the bus since the last scan
    pub fn topology_changed(&self) -> bool  {self.topology_changed.load(Relaxed)}

    /// post a mailbox request to a slave, the request is exchanged during the next cycles
    pub fn mailbox_post(&self, position: u16, ty: MailboxType, payload: Vec<u8>) -> Ticket {
        self.engine.post(position, ty, payload)
    }
    /// answer to a mailbox request, `None` while it is in progress
    pub fn mailbox_take(&self, ticket: Ticket) -> Option<EthercatResult<Vec<u8>, MailboxError>> {
        self.engine.take(ticket)
    }

    fn context(&self) -> SlaveContext<'_> {
        SlaveContext {
            raw: &self.raw,
            config: &self.config.slave,
            cache: &self.cache,
            overrides: self.overrides.as_deref(),
            image: &self.image,
            clock: self.clock.as_ref(),
        }
    }

    /// scan the bus and bring all slaves to operational state
    pub async fn start(&self) -> EthercatResult<MasterState> {
        self.phase(false).await
    }
    /**
        scan the bus again, new slaves are brought to operational state

        slaves in error are left as is, see [Self::recover]
    */
    pub async fn request_scan(&self) -> EthercatResult<MasterState> {
        self.phase(false).await
    }
    /**
        scan the bus again, reset the slaves in error and bring every slave to operational state

        this is the only way for a degraded master to become operational again
    */
    pub async fn recover(&self) -> EthercatResult<MasterState> {
        self.phase(true).await
    }

    async fn phase(&self, recover: bool) -> EthercatResult<MasterState> {
        let mut topology = self.topology.lock().await;
        let ctx = self.context();

        self.set_state(MasterState::Scanning);
        // positions known before are walked again, so slaves lost behind a broken link are reported as gaps
        let known = topology.slaves.keys()
            .chain(topology.gaps.iter().map(|gap| &gap.position))
            .max()
            .map_or(0, |position| position.saturating_add(1));
        let expected = u16::try_from(self.config.expected.len()).unwrap_or(u16::MAX).max(known);
        let scan = match scanner::scan(&self.raw, &self.config.scan, &self.config.slave, expected).await {
            Ok(scan) => scan,
            Err(error) => {
                warn!("scan failed: {}", error);
                self.set_state(MasterState::Degraded);
                return Err(error);
            },
        };
        let previous = core::mem::take(&mut topology.slaves);
        let (slaves, report) = scanner::reconcile(&ctx, previous, &scan, &self.config.expected).await;
        topology.slaves = slaves;
        topology.responders = scan.responders;
        topology.gaps = scan.gaps;
        topology.generation += 1;
        for removal in &report.removed {
            if ! topology.slaves.contains_key(&removal.position) {
                self.engine.forget(removal.position);
            }
        }
        topology.removed = report.removed.clone();
        self.topology_changed.store(false, Relaxed);
        if ! report.unchanged() {
            self.reset_clock(&ctx, &topology).await;
        }
        log_reconciliation(&report);

        self.set_state(MasterState::ConfiguringSlaves);
        for slave in topology.slaves.values_mut() {
            // failures are recorded in the slave diagnostics, they do not prevent the others to start
            let result = if recover && slave.needs_recovery()
                {slave.recover(&ctx).await}
                else if slave.state() != SlaveState::Error
                {slave.drive(&ctx, SlaveState::Operational).await.map(|_| ())}
                else {Ok(())};
            if let Err(error) = result {
                warn!("slave {} not operational: {}", slave.position(), error);
            }
        }

        self.update_snapshot(&topology);
        let state = if self.satisfied(&topology)
            {MasterState::Operational}
            else {MasterState::Degraded};
        self.set_state(state);
        Ok(state)
    }

    /// the reference clock may have left the bus, elect it again among the slaves already configured
    async fn reset_clock(&self, ctx: &SlaveContext<'_>, topology: &Topology) {
        self.clock.reset();
        for slave in topology.slaves.values() {
            if matches!(slave.state(), SlaveState::SafeOperational | SlaveState::Operational) {
                if let Err(error) = self.clock.configure(ctx.raw, slave.clock_slave()).await {
                    warn!("cannot configure clock of slave {}: {}", slave.position(), error);
                }
            }
        }
    }

    /// the operational slaves satisfy the requirement of the configuration
    fn satisfied(&self, topology: &Topology) -> bool {
        if ! self.raw.link_up()
            {return false}
        let operational = topology.slaves.values().filter(|slave| slave.is_operational()).count();
        match self.config.required {
            RequiredSlaves::All => topology.gaps.is_empty() && operational == topology.slaves.len(),
            RequiredSlaves::AtLeast(count) => operational >= count,
        }
    }

    fn update_snapshot(&self, topology: &Topology) {
        *self.snapshot_lock() = TopologySnapshot {
            generation: topology.generation,
            responders: topology.responders,
            slaves: topology.slaves.values().map(Slave::info).collect(),
            gaps: topology.gaps.clone(),
            removed: topology.removed.clone(),
        };
    }

    /**
        exchange process data once

        fails without waiting if the master is not running or a scan is in progress
    */
    pub async fn cycle(&self) -> EthercatResult<CycleReport> {
        if ! matches!(self.master_state(), MasterState::Operational | MasterState::Degraded)
            {return Err(EthercatError::Master("master is not running"))}
        let Ok(mut topology) = self.topology.try_lock()
            else {return Err(EthercatError::Master("scan or configuration in progress"))};
        let responders = topology.responders;
        let report = self.engine.cycle(&self.raw, &mut topology.slaves, &self.image, self.clock.as_ref(), responders).await;

        if report.topology_changed {
            self.topology_changed.store(true, Relaxed);
        }
        if ! report.missed.is_empty() {
            self.update_snapshot(&topology);
        }
        if self.master_state() == MasterState::Operational && ! self.satisfied(&topology) {
            warn!("too few slaves operational, master degraded");
            self.set_state(MasterState::Degraded);
        }
        Ok(report)
    }

    /**
        bring back to operational state the slaves dropped by their process data watchdog, when quick recovery is enabled

        this is meant to be called between cycles, it returns the number of slaves recovered
    */
    pub async fn maintain(&self) -> usize {
        if ! self.config.slave.quick_op
            {return 0}
        let mut topology = self.topology.lock().await;
        let ctx = self.context();
        let mut recovered = 0;
        for slave in topology.slaves.values_mut() {
            if slave.state() != SlaveState::SafeOperational || ! slave.needs_recovery()
                {continue}
            match slave.recover(&ctx).await {
                Ok(()) => recovered += 1,
                Err(error) => warn!("slave {} not recovered: {}", slave.position(), error),
            }
        }
        if recovered != 0 {
            self.update_snapshot(&topology);
        }
        recovered
    }

    /**
        run cycles at the configured period until [Self::stop] is called

        the period is given by a timerfd, slaves dropped by their watchdog are recovered between cycles
    */
    pub async fn run(&self) -> EthercatResult {
        let mut interval = tokio_timerfd::Interval::new_interval(self.config.cyclic.period)?;
        while ! self.stopped.load(Relaxed) {
            match interval.next().await {
                Some(Ok(())) => {},
                Some(Err(error)) => return Err(error.into()),
                None => break,
            }
            match self.cycle().await {
                Ok(report) => if ! report.dropped.is_empty() {
                    self.maintain().await;
                },
                Err(EthercatError::Master(message)) => trace!("cycle skipped: {}", message),
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }
    /// make [Self::run] return after its current cycle, the transport driver is stopped when the master is dropped
    pub fn stop(&self) {
        self.stopped.store(true, Relaxed);
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        let driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(driver) = driver {
            self.raw.stop();
            if driver.join().is_err() {
                error!("transport driver panicked");
            }
        }
    }
}

fn log_reconciliation(report: &Reconciliation) {
    if report.unchanged()
        {debug!("topology unchanged, {} slaves", report.kept.len())}
    else {
        info!("topology changed: {} kept, {} added, {} replaced, {} removed",
            report.kept.len(), report.added.len(), report.replaced.len(), report.removed.len());
    }
    for position in &report.mismatched {
        warn!("slave {} does not match the expected device", position);
    }
}
