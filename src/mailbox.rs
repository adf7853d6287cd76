/*!
    Mailbox (acyclic) communication with slaves.

    A mailbox is a pair of sync manager channels in handshake mode: the master writes a message into the first one (SM0) and the slave answers in the second one (SM1). Reading SM1 while it is empty is not processed by the slave, so the working counter tells whether an answer is there.

    Mailbox messages are not sent on their own: the [MailboxQueue] gathers the requests, and the cyclic exchange hands them to the bus in the frame capacity left by the process data, see [crate::cyclic].

    ETG.1000.4 5.6
*/

use std::{
    collections::{BTreeMap, HashMap},
    time::Instant,
    };
use core::time::Duration;
use bilge::prelude::*;
use log::*;

use crate::{
    data::{self, PduData, Cursor},
    error::{EthercatError, EthercatResult},
    frame::PDU_OVERHEAD,
    queue::Response,
    sii::MailboxLayout,
    };


/// ETG.1000.4 table 29
#[bitsize(48)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct MailboxHeader {
    /// length of the mailbox service data following this header
    pub length: u16,
    /**
        - if a master is client: Station Address of the source
        - if a slave is client: Station Address of the destination
    */
    pub address: u16,
    /// reserved for future
    pub channel: u6,
    /// 0 is lowest priority, 3 is highest
    pub priority: u2,
    pub ty: MailboxType,
    /// counter of the mailbox services, rolling from 1 to 7, 0 is reserved
    pub count: u3,
    reserved: u1,
}
data::bilge_pdudata!(MailboxHeader, u48);

/// ETG.1000.4 table 29
#[bitsize(4)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum MailboxType {
    Exception = 0x0,
    Ads = 0x1,
    Ethernet = 0x2,
    Can = 0x3,
    File = 0x4,
    Servo = 0x5,
    Specific = 0xf,
    /// any unassigned type
    #[fallback]
    Reserved = 0x6,
}

/// error reported by a slave in an exception message, ETG.1000.4 table 30
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MailboxError {
    Syntax,
    UnsupportedProtocol,
    InvalidChannel,
    ServiceNotSupported,
    InvalidHeader,
    SizeTooShort,
    NoMoreMemory,
    InvalidSize,
    ServiceInWork,
    Unknown(u16),
}
impl From<u16> for MailboxError {
    fn from(code: u16) -> Self {
        match code {
            0x1 => Self::Syntax,
            0x2 => Self::UnsupportedProtocol,
            0x3 => Self::InvalidChannel,
            0x4 => Self::ServiceNotSupported,
            0x5 => Self::InvalidHeader,
            0x6 => Self::SizeTooShort,
            0x7 => Self::NoMoreMemory,
            0x8 => Self::InvalidSize,
            0x9 => Self::ServiceInWork,
            other => Self::Unknown(other),
        }
    }
}


/// identifies a request posted in a [MailboxQueue]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Ticket(u64);

/// mailbox of a slave able to exchange messages now
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MailboxTarget {
    /// fixed address of the slave
    pub station: u16,
    pub layout: MailboxLayout,
}

/// datagram to send for a mailbox request, produced by [MailboxQueue::schedule]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MailboxTransfer {
    pub ticket: Ticket,
    pub station: u16,
    /// physical address in the slave
    pub address: u16,
    /// true to write the request in SM0, false to read the answer in SM1
    pub write: bool,
    /// content to write, or zeroed buffer for reading
    pub data: Vec<u8>,
}
impl MailboxTransfer {
    /// bytes this transfer takes in a frame
    pub fn wire_size(&self) -> usize  {PDU_OVERHEAD + self.data.len()}
}

enum Progress {
    /// waiting for the slave mailbox to be written
    Queued,
    /// written, waiting for the answer
    Written,
    Done(EthercatResult<Vec<u8>, MailboxError>),
}

struct Request {
    position: u16,
    ty: MailboxType,
    payload: Vec<u8>,
    count: u8,
    deadline: Instant,
    progress: Progress,
}

/**
    mailbox requests waiting to be exchanged with slaves

    Requests to the same slave are exchanged one at a time in posting order, since a mailbox holds only one message. A request not answered before its timeout fails with [EthercatError::Timeout].
*/
pub struct MailboxQueue {
    timeout: Duration,
    next: u64,
    requests: BTreeMap<Ticket, Request>,
    /// last counter used per slave position
    counters: HashMap<u16, u8>,
}

impl MailboxQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next: 0,
            requests: BTreeMap::new(),
            counters: HashMap::new(),
        }
    }

    /// add a request for the slave at the given position
    pub fn post(&mut self, position: u16, ty: MailboxType, payload: Vec<u8>) -> Ticket {
        let ticket = Ticket(self.next);
        self.next += 1;
        let counter = self.counters.entry(position).or_insert(0);
        *counter = *counter % 7 + 1;
        self.requests.insert(ticket, Request {
            position,
            ty,
            payload,
            count: *counter,
            deadline: Instant::now() + self.timeout,
            progress: Progress::Queued,
        });
        ticket
    }

    /// result of a request, `None` if still in progress or unknown
    pub fn take(&mut self, ticket: Ticket) -> Option<EthercatResult<Vec<u8>, MailboxError>> {
        if ! matches!(self.requests.get(&ticket)?.progress, Progress::Done(_))
            {return None}
        match self.requests.remove(&ticket)?.progress {
            Progress::Done(result) => Some(result),
            _ => None,
        }
    }
    /// number of requests not yet taken
    pub fn len(&self) -> usize  {self.requests.len()}
    pub fn is_empty(&self) -> bool  {self.requests.is_empty()}
    /// true if some requests are waiting to be exchanged
    pub fn has_pending(&self) -> bool {
        self.requests.values().any(|request| ! matches!(request.progress, Progress::Done(_)))
    }

    /// drop the requests of a slave that left the bus
    pub fn forget(&mut self, position: u16) {
        for request in self.requests.values_mut() {
            if request.position == position && ! matches!(request.progress, Progress::Done(_)) {
                request.progress = Progress::Done(Err(EthercatError::Master("slave removed from the bus")));
            }
        }
        self.counters.remove(&position);
    }

    /**
        datagrams to send for the pending requests, within `budget` bytes of frame

        `targets` gives the mailboxes ready for exchange, by slave position. Requests past their deadline fail here.
    */
    pub fn schedule(&mut self, now: Instant, budget: usize, targets: &HashMap<u16, MailboxTarget>) -> Vec<MailboxTransfer> {
        let mut transfers = Vec::new();
        let mut remaining = budget;
        let mut busy = Vec::new();

        for (&ticket, request) in self.requests.iter_mut() {
            if matches!(request.progress, Progress::Done(_))
                {continue}
            if now > request.deadline {
                warn!("mailbox request to slave {} timed out", request.position);
                request.progress = Progress::Done(Err(EthercatError::Timeout("mailbox answer")));
                continue;
            }
            // one message at a time in a mailbox
            if busy.contains(&request.position)
                {continue}
            busy.push(request.position);

            let Some(target) = targets.get(&request.position)
                else {continue};
            let transfer = match request.progress {
                Progress::Queued => {
                    let length = usize::from(target.layout.write.length);
                    if MailboxHeader::packed_size() + request.payload.len() > length {
                        request.progress = Progress::Done(Err(EthercatError::Master("mailbox request bigger than the slave mailbox")));
                        continue;
                    }
                    let mut data = vec![0; length];
                    if let Err(error) = request.pack(&mut data) {
                        request.progress = Progress::Done(Err(error.into()));
                        continue;
                    }
                    MailboxTransfer {
                        ticket,
                        station: target.station,
                        address: target.layout.write.address,
                        write: true,
                        data,
                    }
                },
                _ => MailboxTransfer {
                    ticket,
                    station: target.station,
                    address: target.layout.read.address,
                    write: false,
                    data: vec![0; usize::from(target.layout.read.length)],
                },
            };
            if transfer.wire_size() > remaining
                {continue}
            remaining -= transfer.wire_size();
            transfers.push(transfer);
        }
        transfers
    }

    /// report the outcome of a datagram produced by [Self::schedule]
    pub fn complete(&mut self, transfer: &MailboxTransfer, result: EthercatResult<Response>) {
        let Some(request) = self.requests.get_mut(&transfer.ticket)
            else {return};
        // transport errors are retried until the request deadline
        let Ok(response) = result
            else {return};
        if response.working_count == 0
            {return}
        if transfer.write {
            debug!("mailbox request written to slave {}", request.position);
            request.progress = Progress::Written;
        }
        else {
            request.progress = Progress::Done(parse_answer(&response.data));
        }
    }
}

impl Request {
    fn pack(&self, dst: &mut [u8]) -> data::PackingResult<()> {
        let length = u16::try_from(self.payload.len())
            .map_err(|_| data::PackingError::InvalidValue("mailbox payload too big"))?;
        let header = MailboxHeader::new(
            length,
            0,
            u6::new(0),
            u2::new(0),
            self.ty,
            u3::new(self.count),
            );
        let mut cursor = Cursor::new(dst);
        cursor.pack(&header)?;
        cursor.write(&self.payload)
    }
}

/// content of an answer read in SM1
fn parse_answer(data: &[u8]) -> EthercatResult<Vec<u8>, MailboxError> {
    let mut cursor = Cursor::new(data);
    let header = cursor.unpack::<MailboxHeader>()?;
    let content = cursor.read(usize::from(header.length()))?;
    if header.ty() == MailboxType::Exception {
        let mut cursor = Cursor::new(content);
        let _ty = cursor.unpack::<u16>()?;
        let detail = cursor.unpack::<u16>()?;
        return Err(EthercatError::Slave(MailboxError::from(detail)));
    }
    Ok(content.to_vec())
}



#[cfg(test)]
mod tests {
    use super::*;
    use crate::sii::SyncLayout;

    fn targets() -> HashMap<u16, MailboxTarget> {
        HashMap::from([(0, MailboxTarget {
            station: 0x1000,
            layout: MailboxLayout {
                write: SyncLayout {index: 0, address: 0x1000, length: 0x20, control: 0x26},
                read: SyncLayout {index: 1, address: 0x1080, length: 0x20, control: 0x22},
            },
        })])
    }

    fn response(data: Vec<u8>, working_count: u16) -> EthercatResult<Response> {
        Ok(Response {data, working_count})
    }

    #[test]
    fn request_then_answer() {
        let mut queue = MailboxQueue::new(Duration::from_secs(1));
        let targets = targets();
        let first = queue.post(0, MailboxType::Can, vec![1, 2, 3]);
        let second = queue.post(0, MailboxType::Can, vec![4]);

        // only one request at a time per slave
        let transfers = queue.schedule(Instant::now(), 1000, &targets);
        assert_eq!(transfers.len(), 1);
        let write = &transfers[0];
        assert!(write.write);
        assert_eq!(write.ticket, first);
        assert_eq!(write.data.len(), 0x20);
        let header = MailboxHeader::unpack(&write.data).unwrap();
        assert_eq!(header.length(), 3);
        assert_eq!(header.count().value(), 1);

        // mailbox full, written again next time
        queue.complete(write, response(write.data.clone(), 0));
        let transfers = queue.schedule(Instant::now(), 1000, &targets);
        assert!(transfers[0].write);
        let echo = transfers[0].data.clone();
        queue.complete(&transfers[0], response(echo.clone(), 1));

        // answer not there yet
        let read = queue.schedule(Instant::now(), 1000, &targets).remove(0);
        assert!(! read.write);
        assert_eq!(read.address, 0x1080);
        queue.complete(&read, response(vec![0; 0x20], 0));
        assert!(queue.take(first).is_none());

        let read = queue.schedule(Instant::now(), 1000, &targets).remove(0);
        queue.complete(&read, response(echo, 1));
        assert_eq!(queue.take(first).unwrap().unwrap(), [1, 2, 3]);

        let transfers = queue.schedule(Instant::now(), 1000, &targets);
        assert_eq!(transfers[0].ticket, second);
        assert_eq!(MailboxHeader::unpack(&transfers[0].data).unwrap().count().value(), 2);
    }

    #[test]
    fn budget_and_unavailable_slaves() {
        let mut queue = MailboxQueue::new(Duration::from_secs(1));
        queue.post(0, MailboxType::Can, vec![1]);
        queue.post(5, MailboxType::Can, vec![1]);
        assert!(queue.schedule(Instant::now(), 0x20, &targets()).is_empty());
        assert_eq!(queue.schedule(Instant::now(), 0x20 + PDU_OVERHEAD, &targets()).len(), 1);
        assert!(queue.has_pending());
    }

    #[test]
    fn timeout_and_oversized() {
        let mut queue = MailboxQueue::new(Duration::from_millis(10));
        let late = queue.post(3, MailboxType::Can, vec![1]);
        let big = queue.post(0, MailboxType::Can, vec![0; 0x20]);
        queue.schedule(Instant::now(), 1000, &targets());
        assert!(matches!(queue.take(big), Some(Err(EthercatError::Master(_)))));

        queue.schedule(Instant::now() + Duration::from_millis(20), 1000, &targets());
        assert!(matches!(queue.take(late), Some(Err(EthercatError::Timeout(_)))));
        assert!(queue.is_empty());
    }

    #[test]
    fn exception_answer() {
        let mut answer = vec![0; 16];
        let header = MailboxHeader::new(4, 0, u6::new(0), u2::new(0), MailboxType::Exception, u3::new(1));
        header.pack(&mut answer).unwrap();
        answer[8 .. 10].copy_from_slice(&0x4u16.to_le_bytes());
        assert!(matches!(parse_answer(&answer),
            Err(EthercatError::Slave(MailboxError::ServiceNotSupported))));
    }
}
