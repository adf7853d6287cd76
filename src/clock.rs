/*!
    Clock synchronization step invoked by the master.

    Slaves whose clocks are synchronized run their tasks with the same time reference, and timestamp their inputs consistently. The computation of offsets and delays between clocks is not done here: the master only calls a [ClockSync] implementation at two points

    - when a slave is configured for process data (transition to [SafeOperational](crate::SlaveState::SafeOperational)), so the implementation can program the slave
    - on every cycle, so the implementation can send its drift compensation datagrams along with the process data

    Two implementations are provided: [FreeRun] when slaves are not synchronized, and [ReferenceClock] which distributes the time of the first slave supporting distributed clocks to the others.

    ETG.1000.4 9, ETG.1020.21
*/

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    sync::atomic::{AtomicU64, Ordering::*},
    };
use core::time::Duration;
use async_trait::async_trait;
use log::*;

use crate::{
    registers,
    data::PduData,
    error::{EthercatError, EthercatResult},
    frame::{PduCommand, SlaveAddress, PDU_OVERHEAD},
    queue::Datagram,
    rawmaster::RawMaster,
    };


/// slave informations given to [ClockSync::configure]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ClockSlave {
    pub position: u16,
    /// fixed address of the slave
    pub station: u16,
    /// the slave has a distributed clock unit
    pub distributed_clock: bool,
}

/// synchronization step, pluggable in the [crate::Master]
#[async_trait]
pub trait ClockSync: Send + Sync {
    /// prepare a slave entering safe operational state
    async fn configure(&self, raw: &RawMaster, slave: ClockSlave) -> EthercatResult;
    /// synchronization datagrams of one cycle, they must complete before `deadline`
    async fn cycle(&self, raw: &RawMaster, deadline: Duration) -> EthercatResult;
    /// frame bytes taken by the datagrams of [Self::cycle]
    fn cycle_size(&self) -> usize  {0}
    /// the topology changed, any previous synchronization is obsolete
    fn reset(&self);
}

/// no synchronization, slaves run on their own clock
#[derive(Copy, Clone, Debug, Default)]
pub struct FreeRun;

#[async_trait]
impl ClockSync for FreeRun {
    async fn configure(&self, _raw: &RawMaster, _slave: ClockSlave) -> EthercatResult  {Ok(())}
    async fn cycle(&self, _raw: &RawMaster, _deadline: Duration) -> EthercatResult  {Ok(())}
    fn reset(&self) {}
}


/**
    distribute the system time of a reference slave to every other slave

    The first slave with a distributed clock configured becomes the reference. On each cycle, a `FRMW` datagram reads its system time and writes it to the following slaves, compensating the drift between their clocks.
*/
#[derive(Default)]
pub struct ReferenceClock {
    reference: Mutex<Option<ClockSlave>>,
    /// last system time read on the reference
    time: AtomicU64,
    /// number of successful drift compensations
    syncs: AtomicU64,
}

impl ReferenceClock {
    pub fn new() -> Self  {Self::default()}

    fn reference_lock(&self) -> MutexGuard<'_, Option<ClockSlave>> {
        self.reference.lock().unwrap_or_else(PoisonError::into_inner)
    }
    /// slave used as reference clock, if any
    pub fn reference(&self) -> Option<ClockSlave>  {*self.reference_lock()}
    /// system time of the reference clock at the last cycle, in nanoseconds
    pub fn time(&self) -> u64  {self.time.load(Relaxed)}
    /// number of cycles where the reference time has been distributed
    pub fn syncs(&self) -> u64  {self.syncs.load(Relaxed)}
}

#[async_trait]
impl ClockSync for ReferenceClock {
    async fn configure(&self, raw: &RawMaster, slave: ClockSlave) -> EthercatResult {
        if ! slave.distributed_clock
            {return Ok(())}
        {
            let mut reference = self.reference_lock();
            if reference.is_some()
                {return Ok(())}
            *reference = Some(slave);
        }
        // check the clock is actually readable before relying on it
        let time = raw.fprd(slave.station, registers::dc::system_time).await?.one()?;
        info!("slave {} is the reference clock, system time {}", slave.position, time);
        self.time.store(time, Relaxed);
        Ok(())
    }

    async fn cycle(&self, raw: &RawMaster, deadline: Duration) -> EthercatResult {
        let Some(reference) = self.reference()
            else {return Ok(())};
        let field = registers::dc::system_time;
        let response = raw.transmit(Datagram::new(
                PduCommand::FRMW,
                SlaveAddress::Fixed(reference.station).datagram(field.byte as u32),
                vec![0; field.len],
                )
                .timeout(deadline)
                .retries(0)
                ).await?;
        if response.working_count == 0
            {return Err(EthercatError::Protocol("reference clock did not answer"))}
        self.time.store(u64::unpack(&response.data)?, Relaxed);
        self.syncs.fetch_add(1, Relaxed);
        Ok(())
    }

    fn cycle_size(&self) -> usize {
        if self.reference().is_some()
            {PDU_OVERHEAD + registers::dc::system_time.len}
            else {0}
    }

    fn reset(&self) {
        if let Some(reference) = self.reference_lock().take() {
            debug!("reference clock on slave {} dropped", reference.position);
        }
    }
}
