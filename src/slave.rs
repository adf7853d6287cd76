/*!
    State machine of one slave: its identity, what it is able to do, and the transitions driving it from discovery to operational state.

    The slave states follow the application layer (AL) states of the slave, with two states proper to the master:

    - [SlaveState::Unknown]: the slave has just been discovered, nothing is known beyond its identity probe
    - [SlaveState::Error]: the slave refused a transition, or could not be configured. It is excluded from process data until reset.

    Transitions are requested one step upward at a time by [Slave::step_up], each transition sends the configuration needed by the target state, then requests the state and waits for the slave to report it.

    ```text
    Unknown -> Init -> PreOperational -> SafeOperational -> Operational
       \________\___________\_________________\________________\____ Error -> Init (reset)
    ```
*/

use std::{
    sync::Arc,
    time::Instant,
    };
use core::{fmt, future::Future};
use log::*;

use crate::{
    registers::{self, AlState, AlError, AlControlRequest, SyncManagerChannel, FmmuEntry, SyncDirection},
    error::{EthercatError, EthercatResult, Fault, FaultKind},
    rawmaster::RawMaster,
    config::SlaveConfig,
    eeprom::MailboxTypes,
    sii::{Sii, SiiError, SiiImage, Identity, MailboxLayout, ProcessLayout, SyncLayout},
    cache::{SiiCache, SiiOverride, CacheKey},
    mapping::{ProcessImage, Region},
    clock::{ClockSync, ClockSlave},
    };


/// FMMU used for outputs
const FMMU_OUTPUTS: u8 = 0;
/// FMMU used for inputs
const FMMU_INPUTS: u8 = 1;


/// state of a slave, as known by the master
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SlaveState {
    /// just discovered, not yet initialized
    Unknown,
    Init,
    /// mailbox communication possible
    PreOperational,
    /// inputs are exchanged, outputs are ignored by the slave
    SafeOperational,
    /// inputs and outputs are exchanged
    Operational,
    /// a transition failed, the slave must be reset
    Error,
}

impl SlaveState {
    /// the state following this one in the start-up sequence
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Unknown => Some(Self::Init),
            Self::Init => Some(Self::PreOperational),
            Self::PreOperational => Some(Self::SafeOperational),
            Self::SafeOperational => Some(Self::Operational),
            Self::Operational | Self::Error => None,
        }
    }
    /// position in the start-up sequence, `None` for [Self::Error]
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::Unknown => Some(0),
            Self::Init => Some(1),
            Self::PreOperational => Some(2),
            Self::SafeOperational => Some(3),
            Self::Operational => Some(4),
            Self::Error => None,
        }
    }
    /// AL state to request on the slave to reach this state
    pub fn al(self) -> Option<AlState> {
        match self {
            Self::Init => Some(AlState::Init),
            Self::PreOperational => Some(AlState::PreOperational),
            Self::SafeOperational => Some(AlState::SafeOperational),
            Self::Operational => Some(AlState::Operational),
            Self::Unknown | Self::Error => None,
        }
    }
}
impl From<AlState> for SlaveState {
    fn from(state: AlState) -> Self {
        match state {
            AlState::Init | AlState::Bootstrap => Self::Init,
            AlState::PreOperational => Self::PreOperational,
            AlState::SafeOperational => Self::SafeOperational,
            AlState::Operational => Self::Operational,
        }
    }
}
impl fmt::Display for SlaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}


/**
    what a slave is able to do, deduced from its EEPROM and registers

    The configuration steps consult these instead of specializing per device.
*/
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    /// mailbox sync managers, if the slave has a mailbox
    pub mailbox: Option<MailboxLayout>,
    /// protocols supported over the mailbox
    pub protocols: MailboxTypes,
    /// the slave has a station alias
    pub alias_addressing: bool,
    /// the slave has a distributed clock unit
    pub distributed_clock: bool,
    /// the slave supports `LRW`, otherwise `LWR` and `LRD` are used
    pub logical_exchange: bool,
    /// the slave accepts safe operational state without outputs
    pub safe_op_without_outputs: bool,
}

/// counters and last error of a slave
#[derive(Clone, Debug, Default)]
pub struct SlaveDiagnostics {
    pub last_error: Option<Fault>,
    /// last AL status code reported by the slave
    pub al_status: Option<AlError>,
    /// successful state transitions
    pub transitions: u32,
    /// configuration reads retried
    pub retries: u32,
    /// complete EEPROM reads on the bus
    pub sii_reads: u32,
    /// expiries of the process data watchdog
    pub watchdog_expiries: u32,
    /// returns to operational state without reconfiguration
    pub quick_ops: u32,
}

/// error reported when configuring a slave
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlaveError {
    /// the slave refused to switch to a state, with the reason it gave
    Refused {state: AlState, code: AlError},
    /// the slave EEPROM could not be read
    Sii(SiiError),
    /// the slave is in [SlaveState::Error], it must be reset first
    Stalled,
    /// the slave identity changed since it was discovered
    IdentityChanged,
}
impl From<SiiError> for SlaveError {
    fn from(error: SiiError) -> Self  {Self::Sii(error)}
}
impl From<EthercatError<()>> for EthercatError<SlaveError> {
    fn from(src: EthercatError<()>) -> Self  {src.upgrade()}
}
impl From<EthercatError<SiiError>> for EthercatError<SlaveError> {
    fn from(src: EthercatError<SiiError>) -> Self  {src.into()}
}

/// everything a slave needs to run its transitions, owned by the [crate::Master]
pub struct SlaveContext<'a> {
    pub raw: &'a RawMaster,
    pub config: &'a SlaveConfig,
    pub cache: &'a SiiCache,
    pub overrides: Option<&'a dyn SiiOverride>,
    pub image: &'a ProcessImage,
    pub clock: &'a dyn ClockSync,
}

/// copy of the public informations of a slave
#[derive(Clone, Debug)]
pub struct SlaveInfo {
    pub position: u16,
    pub station: u16,
    pub alias: u16,
    pub identity: Identity,
    pub name: Option<String>,
    pub state: SlaveState,
    pub requested: SlaveState,
    pub region: Option<Region>,
    pub capabilities: Capabilities,
    pub diagnostics: SlaveDiagnostics,
}


/**
    one slave on the bus, and the state machine driving it

    This struct is owned by the [crate::Master], which gives it a [SlaveContext] for each operation on the bus.
*/
pub struct Slave {
    position: u16,
    station: u16,
    alias: u16,
    identity: Identity,

    state: SlaveState,
    requested: SlaveState,
    /// the last drop from operational state was a process data watchdog expiry
    watchdog_dropped: bool,
    /// consecutive process data exchanges missed
    watchdog: u32,

    sii: Option<Arc<SiiImage>>,
    layout: ProcessLayout,
    region: Option<Region>,
    capabilities: Capabilities,
    diagnostics: SlaveDiagnostics,
}

impl Slave {
    /// a slave just discovered, with its station address already assigned
    pub fn new(position: u16, station: u16, alias: u16, identity: Identity) -> Self {
        Self {
            position,
            station,
            alias,
            identity,
            state: SlaveState::Unknown,
            requested: SlaveState::Unknown,
            watchdog_dropped: false,
            watchdog: 0,
            sii: None,
            layout: ProcessLayout::default(),
            region: None,
            capabilities: Capabilities {
                alias_addressing: alias != 0,
                ..Default::default()
            },
            diagnostics: SlaveDiagnostics::default(),
        }
    }

    pub fn position(&self) -> u16  {self.position}
    /// fixed address of the slave
    pub fn station(&self) -> u16  {self.station}
    pub fn alias(&self) -> u16  {self.alias}
    pub fn identity(&self) -> &Identity  {&self.identity}
    pub fn state(&self) -> SlaveState  {self.state}
    /// last state requested by the master
    pub fn requested(&self) -> SlaveState  {self.requested}
    pub fn capabilities(&self) -> &Capabilities  {&self.capabilities}
    pub fn diagnostics(&self) -> &SlaveDiagnostics  {&self.diagnostics}
    /// EEPROM content, once read
    pub fn sii(&self) -> Option<&Arc<SiiImage>>  {self.sii.as_ref()}
    /// process data sizes and sync managers
    pub fn layout(&self) -> &ProcessLayout  {&self.layout}
    /// logical memory of the slave, once configured for process data
    pub fn region(&self) -> Option<Region>  {self.region}
    pub fn is_operational(&self) -> bool  {self.state == SlaveState::Operational}
    /// consecutive process data exchanges missed
    pub fn watchdog(&self) -> u32  {self.watchdog}
    /// key of this slave in the EEPROM cache
    pub fn cache_key(&self) -> CacheKey  {CacheKey::new(self.position, self.alias)}

    /// informations given to the clock synchronization step
    pub fn clock_slave(&self) -> ClockSlave {
        ClockSlave {
            position: self.position,
            station: self.station,
            distributed_clock: self.capabilities.distributed_clock,
        }
    }

    pub fn info(&self) -> SlaveInfo {
        SlaveInfo {
            position: self.position,
            station: self.station,
            alias: self.alias,
            identity: self.identity,
            name: self.sii.as_ref().and_then(|sii| sii.general.name.clone()),
            state: self.state,
            requested: self.requested,
            region: self.region,
            capabilities: self.capabilities,
            diagnostics: self.diagnostics.clone(),
        }
    }

    /// record an error and put the slave in [SlaveState::Error]
    pub fn fail(&mut self, ctx: &SlaveContext<'_>, kind: FaultKind, message: impl Into<String>) {
        let fault = Fault::new(kind, message);
        warn!("slave {} failed: {}", self.position, fault);
        self.diagnostics.last_error = Some(fault);
        self.state = SlaveState::Error;
        self.release(ctx);
    }
    fn failed<T: fmt::Debug>(&mut self, ctx: &SlaveContext<'_>, error: &EthercatError<T>) {
        let kind = match error {
            EthercatError::Slave(_) => FaultKind::SlaveConfiguration,
            other => other.kind(),
        };
        self.fail(ctx, kind, error.to_string());
    }
    /// give back the logical memory, the slave exchanges no more process data
    fn release(&mut self, ctx: &SlaveContext<'_>) {
        if self.region.take().is_some() {
            ctx.image.release(self.position);
        }
    }

    /**
        perform one transition upward, returns the new state

        on failure the slave is left in [SlaveState::Error] with the error recorded in its diagnostics
    */
    pub async fn step_up(&mut self, ctx: &SlaveContext<'_>) -> EthercatResult<SlaveState, SlaveError> {
        let Some(target) = self.state.next() else {
            return match self.state {
                SlaveState::Error => Err(EthercatError::Slave(SlaveError::Stalled)),
                state => Ok(state),
            }};
        self.requested = target;
        debug!("slave {} {} -> {}", self.position, self.state, target);

        let result = match target {
            SlaveState::Init => self.to_init(ctx).await,
            SlaveState::PreOperational => self.to_preop(ctx).await,
            SlaveState::SafeOperational => self.to_safeop(ctx).await,
            SlaveState::Operational => self.transition(ctx, AlState::Operational).await,
            SlaveState::Unknown | SlaveState::Error => Ok(()),
        };
        match result {
            Ok(()) => {
                self.state = target;
                self.diagnostics.transitions += 1;
                if target == SlaveState::Operational {
                    self.watchdog = 0;
                    self.watchdog_dropped = false;
                }
                Ok(target)
            },
            Err(error) => {
                self.failed(ctx, &error);
                Err(error)
            },
        }
    }

    /// perform transitions until the target state, returns the number of transitions done
    pub async fn drive(&mut self, ctx: &SlaveContext<'_>, target: SlaveState) -> EthercatResult<u32, SlaveError> {
        let target = target.rank().ok_or(EthercatError::<SlaveError>::Master("cannot drive a slave to error state"))?;
        let mut transitions = 0;
        loop {
            let current = self.state.rank().ok_or(EthercatError::Slave(SlaveError::Stalled))?;
            if current >= target
                {return Ok(transitions)}
            self.step_up(ctx).await?;
            transitions += 1;
        }
    }

    /**
        force the slave back to [SlaveState::Init], acknowledging any error pending on it

        this is the only way out of [SlaveState::Error]
    */
    pub async fn reset(&mut self, ctx: &SlaveContext<'_>) -> EthercatResult<(), SlaveError> {
        info!("slave {} reset from {}", self.position, self.state);
        self.release(ctx);
        self.requested = SlaveState::Init;
        self.watchdog = 0;
        self.watchdog_dropped = false;
        match self.transition(ctx, AlState::Init).await {
            Ok(()) => {
                // an EEPROM not loaded yet is loaded on the way to preoperational
                self.state = SlaveState::Init;
                Ok(())
            },
            Err(error) => {
                self.failed(ctx, &error);
                Err(error)
            },
        }
    }

    /// update the state from the AL status reported by the slave
    pub async fn refresh(&mut self, ctx: &SlaveContext<'_>) -> EthercatResult<SlaveState> {
        let status = ctx.raw.fprd(self.station, registers::al::status).await?.one()?;
        if status.error() {
            let code = ctx.raw.fprd(self.station, registers::al::error).await?.one()?;
            self.diagnostics.al_status = Some(AlError::from(code));
            if self.state != SlaveState::Error {
                self.fail(ctx, FaultKind::SlaveConfiguration, format!("slave reports error {:?}", AlError::from(code)));
            }
        }
        else if self.state != SlaveState::Error {
            if let Ok(state) = AlState::try_from(status.state()) {
                let state = SlaveState::from(state);
                // a slave is never considered further than it has been configured by this master
                if state.rank() < self.state.rank() {
                    info!("slave {} fell back to {}", self.position, state);
                    self.state = state;
                    if state.rank() < SlaveState::SafeOperational.rank()
                        {self.release(ctx);}
                }
            }
        }
        Ok(self.state)
    }

    /**
        count a missed process data exchange, returns true if this miss expires the watchdog

        on expiry the slave drops to [SlaveState::SafeOperational]: its process data is no longer exchanged until [Self::recover]
    */
    pub fn watchdog_miss(&mut self, threshold: u32) -> bool {
        self.watchdog += 1;
        if self.watchdog < threshold.max(1)
            {return false}
        self.watchdog = 0;
        self.watchdog_dropped = true;
        self.state = SlaveState::SafeOperational;
        self.diagnostics.watchdog_expiries += 1;
        let fault = Fault::new(FaultKind::WatchdogExpired, format!("{} process data exchanges missed", threshold));
        warn!("slave {} dropped out of operational: {}", self.position, fault);
        self.diagnostics.last_error = Some(fault);
        true
    }
    /// a process data exchange succeeded
    pub fn watchdog_ok(&mut self) {
        self.watchdog = 0;
    }

    /// true if the slave is waiting for [Self::recover]
    pub fn needs_recovery(&self) -> bool {
        match self.state {
            SlaveState::Error => true,
            SlaveState::SafeOperational => self.watchdog_dropped,
            _ => false,
        }
    }

    /**
        bring back to operational state a slave dropped by the watchdog or in error

        a slave dropped by the watchdog with an unchanged identity goes directly back to operational state when `quick_op` is enabled, otherwise it is reset and configured again
    */
    pub async fn recover(&mut self, ctx: &SlaveContext<'_>) -> EthercatResult<(), SlaveError> {
        if self.state == SlaveState::SafeOperational && self.watchdog_dropped && ctx.config.quick_op {
            let sii = Sii::new(ctx.raw, self.station, ctx.config.sii_timeout, ctx.config.sii_assign_pdi);
            let probed = async {
                sii.acquire().await?;
                let (_, identity) = sii.read_identity().await?;
                sii.release().await?;
                EthercatResult::<_, SiiError>::Ok(identity)
            }.await;
            match probed {
                Ok(identity) if identity == self.identity => {
                    self.requested = SlaveState::Operational;
                    if let Err(error) = self.transition(ctx, AlState::Operational).await {
                        self.failed(ctx, &error);
                        return Err(error);
                    }
                    info!("slave {} back to operational", self.position);
                    self.state = SlaveState::Operational;
                    self.watchdog = 0;
                    self.watchdog_dropped = false;
                    self.diagnostics.transitions += 1;
                    self.diagnostics.quick_ops += 1;
                    return Ok(());
                },
                Ok(identity) => {
                    self.fail(ctx, FaultKind::Topology, format!("slave changed to {}", identity));
                    return Err(EthercatError::Slave(SlaveError::IdentityChanged));
                },
                Err(error) => {
                    let error = EthercatError::<SlaveError>::from(error);
                    self.failed(ctx, &error);
                    return Err(error);
                },
            }
        }
        self.reset(ctx).await?;
        self.drive(ctx, SlaveState::Operational).await?;
        Ok(())
    }


    /// request an AL state and wait for the slave to reach it
    async fn transition(&mut self, ctx: &SlaveContext<'_>, target: AlState) -> EthercatResult<(), SlaveError> {
        ctx.raw.fpwr(self.station, registers::al::control, AlControlRequest::switch(target)).await?.one()?;

        let start = Instant::now();
        loop {
            let status = ctx.raw.fprd(self.station, registers::al::status).await?.one()?;
            if status.error() {
                let code = AlError::from(ctx.raw.fprd(self.station, registers::al::error).await?.one()?);
                self.diagnostics.al_status = Some(code);
                return Err(EthercatError::Slave(SlaveError::Refused {state: target, code}));
            }
            if AlState::try_from(status.state()) == Ok(target) {
                return Ok(());
            }
            if start.elapsed() > ctx.config.transition_timeout {
                return Err(EthercatError::Timeout("slave state transition"));
            }
            tokio::task::yield_now().await;
        }
    }

    async fn to_init(&mut self, ctx: &SlaveContext<'_>) -> EthercatResult<(), SlaveError> {
        self.transition(ctx, AlState::Init).await?;
        // previous configurations must not interfere
        ctx.raw.fpwr(self.station, registers::fmmu::all, [0; 256]).await?.one()?;
        ctx.raw.fpwr(self.station, registers::sync_manager::all, [0; 128]).await?.one()?;
        self.load_sii(ctx).await
    }

    async fn to_preop(&mut self, ctx: &SlaveContext<'_>) -> EthercatResult<(), SlaveError> {
        if self.sii.is_none() {
            self.load_sii(ctx).await?;
        }
        if let Some(mailbox) = self.capabilities.mailbox {
            let interface = registers::sync_manager::interface;
            ctx.raw.fpwr(self.station, interface.mailbox_write(), channel(&mailbox.write, None)).await?.one()?;
            ctx.raw.fpwr(self.station, interface.mailbox_read(), channel(&mailbox.read, None)).await?.one()?;
        }
        self.transition(ctx, AlState::PreOperational).await
    }

    async fn to_safeop(&mut self, ctx: &SlaveContext<'_>) -> EthercatResult<(), SlaveError> {
        let layout = self.layout;
        let region = ctx.image.allocate(self.position, layout.outputs_size(), layout.inputs_size())?;
        self.region = Some(region);

        if let Some(time) = ctx.config.sync_watchdog {
            ctx.raw.fpwr(self.station, registers::watchdog::sync_manager, time).await?.one()?;
        }
        let interface = registers::sync_manager::interface;
        let fmmu = registers::fmmu::interface;
        if let Some(outputs) = layout.outputs {
            ctx.raw.fpwr(self.station, interface.channel(outputs.index),
                channel(&outputs, ctx.config.sync_watchdog)).await?.one()?;
            ctx.raw.fpwr(self.station, fmmu.entry(FMMU_OUTPUTS),
                FmmuEntry::bytes(region.logical, region.outputs, outputs.address, SyncDirection::Write)).await?.one()?;
        }
        if let Some(inputs) = layout.inputs {
            ctx.raw.fpwr(self.station, interface.channel(inputs.index),
                channel(&inputs, None)).await?.one()?;
            ctx.raw.fpwr(self.station, fmmu.entry(FMMU_INPUTS),
                FmmuEntry::bytes(region.inputs_logical(), region.inputs, inputs.address, SyncDirection::Read)).await?.one()?;
        }
        ctx.clock.configure(ctx.raw, self.clock_slave()).await?;
        self.transition(ctx, AlState::SafeOperational).await
    }

    /// get the EEPROM content from the cache, the override source, or the slave
    async fn load_sii(&mut self, ctx: &SlaveContext<'_>) -> EthercatResult<(), SlaveError> {
        let key = self.cache_key();
        let cached = if ctx.config.sii_cache
            {ctx.cache.validate(key, &self.identity)}
            else {None};
        let image = match cached {
            Some(image) => {
                debug!("slave {} eeprom found in cache", self.position);
                image
            },
            None => {
                let image = match ctx.overrides.and_then(|overrides| overrides.image(&self.identity)) {
                    Some(raw) => SiiImage::parse(raw).map_err(|error| EthercatError::<SlaveError>::Slave(error.into()))?,
                    None => {
                        let (station, config) = (self.station, ctx.config);
                        let raw = retry(config.config_retries, &mut self.diagnostics.retries, "eeprom read", || async move {
                            let sii = Sii::new(ctx.raw, station, config.sii_timeout, config.sii_assign_pdi);
                            sii.acquire().await?;
                            let image = sii.read_image().await?;
                            sii.release().await?;
                            EthercatResult::<_, SlaveError>::Ok(image)
                        }).await?;
                        self.diagnostics.sii_reads += 1;
                        SiiImage::parse(raw).map_err(|error| EthercatError::<SlaveError>::Slave(error.into()))?
                    },
                };
                if image.identity != self.identity {
                    warn!("slave {} eeprom describes {} but identity probe gave {}", self.position, image.identity, self.identity);
                }
                let image = Arc::new(image);
                if ctx.config.sii_cache {
                    ctx.cache.store(key, image.clone());
                }
                image
            },
        };

        let (station, config) = (self.station, ctx.config);
        let information = retry(config.config_retries, &mut self.diagnostics.retries, "dl information", || async move {
            EthercatResult::<_, SlaveError>::Ok(ctx.raw.fprd(station, registers::dl::information).await?.one()?)
        }).await?;

        self.layout = image.process_layout();
        self.capabilities = Capabilities {
            mailbox: image.mailbox,
            protocols: image.protocols,
            alias_addressing: self.alias != 0,
            distributed_clock: information.dc_supported(),
            logical_exchange: ! information.logical_exchange_not_supported() && ! image.general.not_lrw,
            safe_op_without_outputs: image.general.safe_op,
        };
        self.sii = Some(image);
        Ok(())
    }
}

/// sync manager channel configuration for a layout read in the EEPROM
fn channel(layout: &SyncLayout, watchdog: Option<u16>) -> SyncManagerChannel {
    let mut channel = SyncManagerChannel::enabled(layout.address, layout.length, layout.control);
    if watchdog.is_some() {
        channel.set_watchdog(true);
    }
    channel
}

/// run a configuration read, retrying it on failure
async fn retry<T, F, Fut>(retries: u8, counter: &mut u32, what: &str, mut operation: F) -> EthercatResult<T, SlaveError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EthercatResult<T, SlaveError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < retries => {
                attempt += 1;
                *counter += 1;
                warn!("{} failed, retrying ({}/{}): {}", what, attempt, retries, error);
            },
            Err(error) => return Err(error),
        }
    }
}



#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_up_sequence() {
        let mut state = SlaveState::Unknown;
        let mut sequence = vec![state];
        while let Some(next) = state.next() {
            assert!(next.rank() > state.rank());
            sequence.push(next);
            state = next;
        }
        assert_eq!(sequence, [
            SlaveState::Unknown,
            SlaveState::Init,
            SlaveState::PreOperational,
            SlaveState::SafeOperational,
            SlaveState::Operational,
            ]);
        assert_eq!(SlaveState::Error.next(), None);
        assert_eq!(SlaveState::Error.rank(), None);
        assert_eq!(SlaveState::from(AlState::Bootstrap), SlaveState::Init);
        assert_eq!(SlaveState::SafeOperational.al(), Some(AlState::SafeOperational));
    }

    #[test]
    fn watchdog_expiry() {
        let mut slave = Slave::new(2, 0x1002, 0, Identity::default());
        slave.state = SlaveState::Operational;

        assert!(! slave.watchdog_miss(3));
        assert!(! slave.watchdog_miss(3));
        slave.watchdog_ok();
        assert!(! slave.watchdog_miss(3));
        assert!(! slave.watchdog_miss(3));
        assert_eq!(slave.state(), SlaveState::Operational);
        assert!(! slave.needs_recovery());

        assert!(slave.watchdog_miss(3));
        assert_eq!(slave.state(), SlaveState::SafeOperational);
        assert!(slave.needs_recovery());
        assert_eq!(slave.diagnostics().watchdog_expiries, 1);
        assert_eq!(slave.diagnostics().last_error.as_ref().map(|fault| fault.kind),
            Some(FaultKind::WatchdogExpired));
    }

    #[test]
    fn alias_is_cache_key() {
        let slave = Slave::new(4, 0x1004, 0x77, Identity::default());
        assert_eq!(slave.cache_key(), CacheKey::Alias(0x77));
        assert!(slave.capabilities().alias_addressing);
        assert_eq!(Slave::new(4, 0x1004, 0, Identity::default()).cache_key(), CacheKey::Position(4));
    }
}
