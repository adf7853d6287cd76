/*!
    Cyclic exchange of process data with the operational slaves, and the acyclic traffic using what remains of the cycle frame.

    One cycle sends concurrently, so the transport driver packs them in the same frame when they fit:

    - one logical datagram per operational slave region, `LRW` or `LWR` + `LRD` for slaves not supporting `LRW`
    - a broadcast read of the AL status, whose working counter is the number of slaves on the bus
    - the datagrams of the [ClockSync] step
    - mailbox transfers, only in the frame space left by the above

    Every datagram of a cycle has the same deadline and no retry: a late answer is useless for a realtime cycle, the exchange is counted as missed. A slave missing [CyclicConfig::watchdog_threshold] exchanges in a row drops out of operational state.
*/

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
    sync::atomic::{AtomicU64, Ordering::*},
    time::Instant,
    };
use core::time::Duration;
use futures_concurrency::future::Join;
use log::*;

use crate::{
    registers,
    data::PduData,
    error::{EthercatError, EthercatResult, Fault, FaultKind},
    frame::{EthercatHeader, PduCommand, SlaveAddress},
    queue::{Datagram, Response},
    rawmaster::RawMaster,
    config::CyclicConfig,
    mapping::{ProcessImage, Region},
    mailbox::{MailboxQueue, MailboxTarget, MailboxType, MailboxError, Ticket},
    clock::ClockSync,
    slave::{Slave, SlaveState},
    };


/// shortest deadline derived from the measured latency
const MIN_DEADLINE: Duration = Duration::from_micros(200);


/// outcome of one cycle
#[derive(Clone, Debug, Default)]
pub struct CycleReport {
    /// incremented at each cycle
    pub cycle: u64,
    /// slaves whose process data was exchanged
    pub exchanged: Vec<u16>,
    /// slaves which missed the exchange
    pub missed: Vec<u16>,
    /// slaves which dropped out of operational state in this cycle
    pub dropped: Vec<u16>,
    /// slaves answering the AL status broadcast, `None` if the broadcast got no answer in time
    pub responders: Option<u16>,
    /// the number of slaves answering differs from the known topology
    pub topology_changed: bool,
    /// mailbox datagrams sent with the process data
    pub mailbox_transfers: usize,
    /// deadline used for the datagrams of this cycle
    pub deadline: Duration,
    pub elapsed: Duration,
    /// the cycle took longer than its period
    pub overrun: bool,
    /// failures not attributable to a slave, like a transport failure or a clock step failure
    pub faults: Vec<Fault>,
}

/// counters over all cycles
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CyclicStats {
    pub cycles: u64,
    pub overruns: u64,
    pub misses: u64,
    pub watchdog_expiries: u64,
}

/// logical datagrams exchanging the process data of one slave
#[derive(Copy, Clone, Debug)]
struct Exchange {
    position: u16,
    region: Region,
    logical_exchange: bool,
}
impl Exchange {
    /// bytes taken in the frame
    fn wire_size(&self) -> usize {
        use crate::frame::PDU_OVERHEAD;
        if self.logical_exchange
            {PDU_OVERHEAD + self.region.size()}
        else {
            [self.region.outputs, self.region.inputs].iter()
                .filter(|&&size| size != 0)
                .map(|&size| PDU_OVERHEAD + usize::from(size))
                .sum()
        }
    }
}

/**
    process data exchange engine

    it only borrows the slaves and the process image for the duration of a cycle, so the [crate::Master] keeps their ownership
*/
pub struct CyclicEngine {
    config: CyclicConfig,
    mailbox: Mutex<MailboxQueue>,
    cycles: AtomicU64,
    stats: Mutex<CyclicStats>,
}

impl CyclicEngine {
    pub fn new(config: CyclicConfig) -> Self {
        Self {
            mailbox: Mutex::new(MailboxQueue::new(config.mailbox_timeout)),
            config,
            cycles: AtomicU64::new(0),
            stats: Mutex::new(CyclicStats::default()),
        }
    }
    pub fn config(&self) -> &CyclicConfig  {&self.config}
    fn mailbox(&self) -> MutexGuard<'_, MailboxQueue> {
        self.mailbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
    fn stats_lock(&self) -> MutexGuard<'_, CyclicStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
    pub fn stats(&self) -> CyclicStats  {*self.stats_lock()}

    /// post a mailbox request, it will be exchanged in the next cycles
    pub fn post(&self, position: u16, ty: MailboxType, payload: Vec<u8>) -> Ticket {
        self.mailbox().post(position, ty, payload)
    }
    /// answer to a mailbox request, `None` while it is in progress
    pub fn take(&self, ticket: Ticket) -> Option<EthercatResult<Vec<u8>, MailboxError>> {
        self.mailbox().take(ticket)
    }
    /// abort the mailbox requests of a slave no longer on the bus
    pub fn forget(&self, position: u16) {
        self.mailbox().forget(position)
    }

    /**
        deadline of the datagrams of a cycle

        the configured deadline if any, else twice the worst frame round trip measured, bounded by the cycle period
    */
    pub fn deadline(&self, raw: &RawMaster) -> Duration {
        if let Some(deadline) = self.config.deadline
            {return deadline}
        raw.latency().max
            .map(|max| (max * 2).max(MIN_DEADLINE))
            .unwrap_or_else(|| raw.response_timeout())
            .min(self.config.period)
    }

    /**
        run one cycle

        `responders` is the number of slaves expected to answer a broadcast, as known from the last scan
    */
    pub async fn cycle(
        &self,
        raw: &RawMaster,
        slaves: &mut BTreeMap<u16, Slave>,
        image: &ProcessImage,
        clock: &dyn ClockSync,
        responders: u16,
    ) -> CycleReport {
        let start = Instant::now();
        let deadline = self.deadline(raw);
        let mut report = CycleReport {
            cycle: self.cycles.fetch_add(1, Relaxed),
            deadline,
            ..Default::default()
        };

        let exchanges = slaves.values()
            .filter(|slave| slave.state() == SlaveState::Operational)
            .filter_map(|slave| Some(Exchange {
                position: slave.position(),
                region: slave.region().filter(|region| ! region.is_empty())?,
                logical_exchange: slave.capabilities().logical_exchange,
                }))
            .collect::<Vec<_>>();
        let status = registers::al::status;
        let broadcast = Datagram::new(
                PduCommand::BRD,
                SlaveAddress::Broadcast.datagram(status.byte as u32),
                vec![0; status.len],
                ).timeout(deadline).retries(0);

        let spare = spare_frame(raw.max_frame(), broadcast.wire_size() + clock.cycle_size(), &exchanges);
        let targets = slaves.values()
            .filter(|slave| matches!(slave.state(),
                SlaveState::PreOperational | SlaveState::SafeOperational | SlaveState::Operational))
            .filter_map(|slave| Some((slave.position(), MailboxTarget {
                station: slave.station(),
                layout: slave.capabilities().mailbox?,
                })))
            .collect::<HashMap<_,_>>();
        let transfers = self.mailbox().schedule(start, spare, &targets);
        report.mailbox_transfers = transfers.len();

        let (outcomes, broadcast, clock_result, transfers) = (
            exchanges.iter()
                .map(|exchange| self.exchange(raw, image, *exchange, deadline))
                .collect::<Vec<_>>()
                .join(),
            raw.transmit(broadcast),
            clock.cycle(raw, deadline),
            transfers.into_iter()
                .map(|transfer| async move {
                    let command = if transfer.write {PduCommand::FPWR} else {PduCommand::FPRD};
                    let result = raw.transmit(Datagram::new(
                            command,
                            SlaveAddress::Fixed(transfer.station).datagram(u32::from(transfer.address)),
                            transfer.data.clone(),
                            ).timeout(deadline).retries(0)).await;
                    (transfer, result)
                })
                .collect::<Vec<_>>()
                .join(),
        ).join().await;

        {
            let mut mailbox = self.mailbox();
            for (transfer, result) in &transfers {
                mailbox.complete(transfer, result.clone());
            }
        }
        match broadcast {
            Ok(response) => {
                report.responders = Some(response.working_count);
                if response.working_count != responders {
                    warn!("{} slaves answering instead of {}, topology changed", response.working_count, responders);
                    report.topology_changed = true;
                }
            },
            Err(error) => report.faults.push(Fault::from_error(&error)),
        }
        if let Err(error) = clock_result {
            report.faults.push(Fault::from_error(&error));
        }
        if ! raw.link_up() {
            report.faults.push(Fault::new(FaultKind::Transport, "transport link down"));
        }

        let threshold = self.config.watchdog_threshold;
        for (position, result) in outcomes {
            let Some(slave) = slaves.get_mut(&position)
                else {continue};
            match result {
                Ok(()) => {
                    slave.watchdog_ok();
                    report.exchanged.push(position);
                },
                Err(error) => {
                    trace!("slave {} missed process data: {}", position, error);
                    report.missed.push(position);
                    if matches!(error, EthercatError::Io(_)) && ! report.faults.iter().any(|fault| fault.kind == FaultKind::Transport) {
                        report.faults.push(Fault::from_error(&error));
                    }
                    if slave.watchdog_miss(threshold) {
                        report.dropped.push(position);
                    }
                },
            }
        }

        report.elapsed = start.elapsed();
        report.overrun = report.elapsed > self.config.period;
        {
            let mut stats = self.stats_lock();
            stats.cycles += 1;
            stats.misses += report.missed.len() as u64;
            stats.watchdog_expiries += report.dropped.len() as u64;
            if report.overrun {
                stats.overruns += 1;
            }
        }
        if report.overrun {
            debug!("cycle {} overrun: {:?}", report.cycle, report.elapsed);
        }
        report
    }

    /// exchange the process data of one slave, checking the working counter
    async fn exchange(&self, raw: &RawMaster, image: &ProcessImage, exchange: Exchange, deadline: Duration) -> (u16, EthercatResult) {
        let region = exchange.region;
        let send = |command, address, data| raw.transmit(
            Datagram::new(command, address, data)
                .timeout(deadline)
                .retries(0)
            );
        let result: EthercatResult = async {
            if exchange.logical_exchange {
                let expected = 2 * u16::from(region.outputs != 0) + u16::from(region.inputs != 0);
                let response = send(PduCommand::LRW, region.logical, image.load_outputs(&region)).await?;
                check(&response, expected)?;
                image.store_inputs(&region, &response.data);
            }
            else {
                let outputs = image.load_outputs(&region);
                let (written, read) = (
                    async {
                        if region.outputs == 0
                            {return Ok(None)}
                        send(PduCommand::LWR, region.logical, outputs[region.outputs_range()].to_vec()).await.map(Some)
                    },
                    async {
                        if region.inputs == 0
                            {return Ok(None)}
                        send(PduCommand::LRD, region.inputs_logical(), vec![0; usize::from(region.inputs)]).await.map(Some)
                    },
                ).join().await;
                if let Some(response) = written? {
                    check(&response, 1)?;
                }
                if let Some(response) = read? {
                    check(&response, 1)?;
                    let mut buffer = vec![0; region.size()];
                    buffer[region.inputs_range()].copy_from_slice(&response.data);
                    image.store_inputs(&region, &buffer);
                }
            }
            Ok(())
        }.await;
        (exchange.position, result)
    }
}

fn check(response: &Response, expected: u16) -> EthercatResult {
    if response.working_count == expected
        {Ok(())}
    else
        {Err(EthercatError::Protocol("unexpected working counter"))}
}



/// frame space left to mailbox transfers once the process data and the cycle datagrams are placed
fn spare_frame(max_frame: usize, cycle_datagrams: usize, exchanges: &[Exchange]) -> usize {
    let used = EthercatHeader::packed_size()
        + cycle_datagrams
        + exchanges.iter().map(Exchange::wire_size).sum::<usize>();
    max_frame.saturating_sub(used)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_sizes() {
        let region = Region {logical: 0x1_0000, outputs: 4, inputs: 2};
        let lrw = Exchange {position: 0, region, logical_exchange: true};
        assert_eq!(lrw.wire_size(), 12 + 6);
        let split = Exchange {logical_exchange: false, ..lrw};
        assert_eq!(split.wire_size(), 12 + 4 + 12 + 2);
        let inputs_only = Exchange {region: Region {outputs: 0, ..region}, ..split};
        assert_eq!(inputs_only.wire_size(), 12 + 2);
    }

    #[test]
    fn mailbox_budget() {
        let region = Region {logical: 0, outputs: 4, inputs: 4};
        let exchanges = [Exchange {position: 0, region, logical_exchange: true}];
        let header = EthercatHeader::packed_size();
        assert_eq!(spare_frame(100, 0, &exchanges), 100 - header - 20);
        // a clock step takes its datagram out of the mailbox space
        assert_eq!(spare_frame(100, 20, &exchanges), 100 - header - 20 - 20);
        assert_eq!(spare_frame(30, 20, &exchanges), 0);
    }

    #[test]
    fn working_counter() {
        let response = Response {data: vec![], working_count: 3};
        assert!(check(&response, 3).is_ok());
        assert!(check(&response, 2).is_err());
    }
}
