/*!
    Datagram queue: batches datagrams into frames, and matches returning frames to the datagrams waiting for them.

    This is a pure bookkeeping structure, it never touches the socket itself. [crate::RawMaster] drives it: it enqueues datagrams for async tasks, flushes frames to the socket, feeds back the frames received, and polls for completion.

    Every datagram in flight is identified by the tag (PDU index) it was given when flushed. A returning datagram is matched by this tag only, then checked against what was sent, so frames partially lost or received out of order cannot complete the wrong datagram.
*/

use std::{
    collections::{BTreeMap, BTreeSet},
    time::{Duration, Instant},
    };
use log::*;

use crate::{
    data::{PduData, Cursor},
    error::{EthercatError, EthercatResult},
    frame::{EthercatHeader, PduHeader, PduCommand, MAX_ETHERCAT_FRAME, PDU_OVERHEAD, ETHERCAT_TYPE_PDU},
    };


/// number of distinct tags available, as the PDU index is coded on 8 bits
const TAGS: usize = 256;

/// identifier of an enqueued datagram, increasing with enqueue order
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Handle(u64);

/// one addressed operation to send on the bus
#[derive(Clone, Debug)]
pub struct Datagram {
    pub command: PduCommand,
    /// 32 bit address, see [PduHeader::address]
    pub address: u32,
    /// payload to send, the answer will have the same size
    pub data: Vec<u8>,
    /// deadline for each transmission, relative to the frame send time
    pub timeout: Duration,
    /// number of retransmissions allowed after the first one
    pub retries: u8,
}
impl Datagram {
    pub fn new(command: PduCommand, address: u32, data: Vec<u8>) -> Self {
        Self {command, address, data, timeout: Duration::from_millis(10), retries: 3}
    }
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
    pub fn retries(mut self, retries: u8) -> Self {
        self.retries = retries;
        self
    }
    /// size taken by this datagram in a frame
    pub fn wire_size(&self) -> usize {
        PDU_OVERHEAD + self.data.len()
    }
}

/// answer to a datagram
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Response {
    pub data: Vec<u8>,
    /// number of slaves that processed the datagram, the meaning depend on the command
    pub working_count: u16,
}

/// frame ready to be sent on the bus
#[derive(Clone, Debug)]
pub struct OutgoingFrame {
    /// sequence number of the frame since the queue creation
    pub id: u64,
    /// whole ethercat frame, starting at the ethercat header
    pub data: Vec<u8>,
    /// datagrams in this frame, in the order they are placed
    pub handles: Vec<Handle>,
}

/// round trip times of frames
#[derive(Copy, Clone, Debug, Default)]
pub struct Latency {
    pub last: Option<Duration>,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    total: Duration,
    pub samples: u64,
}
impl Latency {
    fn record(&mut self, rtt: Duration) {
        self.last = Some(rtt);
        self.min = Some(self.min.map_or(rtt, |min| min.min(rtt)));
        self.max = Some(self.max.map_or(rtt, |max| max.max(rtt)));
        self.total += rtt;
        self.samples += 1;
    }
    pub fn mean(&self) -> Option<Duration> {
        if self.samples == 0  {None}
        else {Some(self.total / u32::try_from(self.samples).unwrap_or(u32::MAX))}
    }
}

/// counters of the queue activity
#[derive(Copy, Clone, Debug, Default)]
pub struct QueueStats {
    pub frames: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub corrupted: u64,
    pub stale: u64,
}

enum State {
    /// waiting for a flush
    Queued,
    InFlight {tag: u8, frame: u64, sent: Instant, deadline: Instant},
    Done(EthercatResult<Response>),
}
struct Entry {
    datagram: Datagram,
    state: State,
    /// number of transmissions so far
    attempts: u8,
    /// no task will take the result anymore
    abandoned: bool,
    /// already returned by [DatagramQueue::poll]
    reported: bool,
}

/// see the module documentation
pub struct DatagramQueue {
    max_frame: usize,
    next_handle: u64,
    next_frame: u64,
    entries: BTreeMap<Handle, Entry>,
    /// datagrams waiting for a flush, ordered by enqueue order
    queued: BTreeSet<Handle>,
    /// datagram in flight for each tag
    tags: [Option<Handle>; TAGS],
    /// next tag to try, tags are given round robin so a tag is not reused right after its release
    next_tag: usize,
    latency: Latency,
    stats: QueueStats,
}

impl DatagramQueue {
    /// `max_frame` is the maximum frame size, ethercat header included
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame: max_frame.min(MAX_ETHERCAT_FRAME),
            next_handle: 0,
            next_frame: 0,
            entries: BTreeMap::new(),
            queued: BTreeSet::new(),
            tags: [None; TAGS],
            next_tag: 0,
            latency: Latency::default(),
            stats: QueueStats::default(),
        }
    }
    pub fn max_frame(&self) -> usize  {self.max_frame}
    /// free payload space in an empty frame, for one datagram
    pub fn max_payload(&self) -> usize {
        self.max_frame - EthercatHeader::packed_size() - PDU_OVERHEAD
    }
    pub fn latency(&self) -> Latency  {self.latency}
    pub fn stats(&self) -> QueueStats  {self.stats}

    /// add a datagram to send with the next flush
    pub fn enqueue(&mut self, datagram: Datagram) -> EthercatResult<Handle> {
        if datagram.data.len() > self.max_payload()
            {return Err(EthercatError::Master("datagram too big for a frame"))}
        let handle = Handle(self.next_handle);
        self.next_handle += 1;
        self.entries.insert(handle, Entry {
            datagram,
            state: State::Queued,
            attempts: 0,
            abandoned: false,
            reported: false,
            });
        self.queued.insert(handle);
        Ok(handle)
    }
    /// true if some datagrams are waiting for a flush
    pub fn has_queued(&self) -> bool  {! self.queued.is_empty()}
    /// earliest deadline of datagrams in flight
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values()
            .filter_map(|entry| match entry.state {
                State::InFlight {deadline, ..} => Some(deadline),
                _ => None,
                })
            .min()
    }

    /**
        pack queued datagrams into frames, in enqueue order

        datagrams that cannot get a tag (because all tags are in flight) stay queued for a later flush
    */
    pub fn flush(&mut self, now: Instant) -> Vec<OutgoingFrame> {
        let mut frames = Vec::new();
        let mut current: Option<(OutgoingFrame, Option<usize>)> = None;

        let queued: Vec<Handle> = self.queued.iter().copied().collect();
        for handle in queued {
            let Some(tag) = self.allocate_tag(handle)
                else {break};
            let Some(entry) = self.entries.get_mut(&handle)
                else {continue};
            self.queued.remove(&handle);

            let size = entry.datagram.wire_size();
            if current.as_ref().map_or(false, |(frame, _)| frame.data.len() + size > self.max_frame) {
                frames.extend(current.take().map(|(frame, _)| frame));
            }
            let (frame, last) = current.get_or_insert_with(|| {
                let id = self.next_frame;
                self.next_frame += 1;
                (OutgoingFrame {
                    id,
                    data: vec![0; EthercatHeader::packed_size()],
                    handles: Vec::new(),
                    }, None)
                });
            // the previous datagram is followed by this one
            if let Some(start) = *last {
                frame.data[start + 7] |= 0x80;
            }
            *last = Some(frame.data.len());

            let start = frame.data.len();
            frame.data.resize(start + size, 0);
            let mut cursor = Cursor::new(&mut frame.data[start ..]);
            let written = cursor.pack(&PduHeader::request(
                    entry.datagram.command,
                    tag,
                    entry.datagram.address,
                    entry.datagram.data.len() as u16,
                    false,
                    ))
                .and_then(|_| cursor.write(&entry.datagram.data));
            if let Err(error) = written {
                // cannot happen since the frame has been resized for the datagram
                error!("datagram packing failed: {:?}", error);
            }
            frame.handles.push(handle);

            entry.attempts += 1;
            entry.state = State::InFlight {
                tag,
                frame: frame.id,
                sent: now,
                deadline: now + entry.datagram.timeout,
                };
        }
        frames.extend(current.take().map(|(frame, _)| frame));

        for frame in frames.iter_mut() {
            let len = (frame.data.len() - EthercatHeader::packed_size()) as u16;
            if let Err(error) = EthercatHeader::pdu(len).pack(&mut frame.data) {
                error!("frame header packing failed: {:?}", error);
            }
        }
        self.stats.frames += frames.len() as u64;
        frames
    }

    /**
        process a frame received from the bus

        returns the id of the sent frame the received one answers, if any of its datagrams was still expected
    */
    pub fn receive(&mut self, frame: &[u8], now: Instant) -> EthercatResult<Option<u64>> {
        let mut cursor = Cursor::new(frame);
        let header = cursor.unpack::<EthercatHeader>()?;
        if header.ty().value() != ETHERCAT_TYPE_PDU
            {return Err(EthercatError::Protocol("received a frame which is not carrying PDUs"))}
        let content = cursor.read(usize::from(header.len().value()))?;

        let mut answered = None;
        let mut cursor = Cursor::new(content);
        loop {
            let header = cursor.unpack::<PduHeader>()?;
            let data = cursor.read(usize::from(header.len().value()))?;
            let working_count = cursor.unpack::<u16>()?;

            if let Some(frame) = self.answer(&header, data, working_count, now) {
                answered.get_or_insert(frame);
            }
            if ! header.next() || cursor.remain().is_empty()  {break}
        }
        Ok(answered)
    }

    /// complete the datagram matching a received PDU, returns the sent frame id
    fn answer(&mut self, header: &PduHeader, data: &[u8], working_count: u16, now: Instant) -> Option<u64> {
        let tag = header.token();
        let Some(handle) = self.tags[usize::from(tag)]
            else {
                self.stats.stale += 1;
                debug!("stale datagram with tag {}", tag);
                return None
            };
        let entry = self.entries.get_mut(&handle)?;
        let State::InFlight {frame, sent, ..} = entry.state
            else {return None};
        self.tags[usize::from(tag)] = None;
        self.latency.record(now.saturating_duration_since(sent));

        let command = PduCommand::from(header.command());
        // slaves increment the position part of the address while processing
        let mask = if command.position_addressed() {0xffff_0000} else {0xffff_ffff};
        if command != entry.datagram.command
        || header.address() & mask != entry.datagram.address & mask
        || data.len() != entry.datagram.data.len() {
            self.stats.corrupted += 1;
            warn!("corrupted answer for datagram {:?} with tag {}", handle, tag);
            self.retry_or_fail(handle, EthercatError::Protocol("corrupted datagram answer"));
        }
        else {
            entry.state = State::Done(Ok(Response {
                data: data.to_vec(),
                working_count,
                }));
        }
        Some(frame)
    }

    /// a frame could not be sent, its datagrams are retried or failed
    pub fn transport_failed(&mut self, frame: &OutgoingFrame) {
        for &handle in &frame.handles {
            let sent_in_frame = self.entries.get(&handle)
                .map_or(false, |entry| matches!(entry.state, State::InFlight {frame: id, ..} if id == frame.id));
            if sent_in_frame {
                self.release_tag(handle);
                self.retry_or_fail(handle, EthercatError::Timeout("frame could not be sent"));
            }
        }
    }

    /**
        expire datagrams in flight past their deadline, and return the datagrams completed since the last poll, in enqueue order

        expired datagrams are retried until their retry budget is exhausted, then they fail with a timeout
    */
    pub fn poll(&mut self, now: Instant) -> Vec<Handle> {
        let expired: Vec<Handle> = self.entries.iter()
            .filter(|(_, entry)| matches!(entry.state, State::InFlight {deadline, ..} if deadline <= now))
            .map(|(&handle, _)| handle)
            .collect();
        for handle in expired {
            self.release_tag(handle);
            self.retry_or_fail(handle, EthercatError::Timeout("no answer to datagram"));
        }

        let mut completed = Vec::new();
        let mut forgotten = Vec::new();
        for (&handle, entry) in self.entries.iter_mut() {
            if let State::Done(_) = entry.state {
                if entry.abandoned
                    {forgotten.push(handle)}
                else if ! entry.reported {
                    entry.reported = true;
                    completed.push(handle);
                }
            }
        }
        for handle in forgotten {
            self.entries.remove(&handle);
        }
        completed
    }

    /// retreive the result of a completed datagram, it is then forgotten by the queue
    pub fn take(&mut self, handle: Handle) -> Option<EthercatResult<Response>> {
        if ! matches!(self.entries.get(&handle)?.state, State::Done(_))
            {return None}
        match self.entries.remove(&handle)?.state {
            State::Done(result) => Some(result),
            _ => None,
        }
    }
    /**
        declare that no task will take the result of this datagram

        A datagram not sent yet is simply removed. A datagram in flight is not cancelled: it keeps its tag until it is answered or expires, and its result is then discarded.
    */
    pub fn abandon(&mut self, handle: Handle) {
        let Some(entry) = self.entries.get_mut(&handle)
            else {return};
        match entry.state {
            State::Queued => {
                self.queued.remove(&handle);
                self.entries.remove(&handle);
            },
            State::InFlight {..} => {
                entry.abandoned = true;
                entry.datagram.retries = 0;
            },
            State::Done(_) => {
                self.entries.remove(&handle);
            },
        }
    }
    /// number of datagrams known by the queue, whatever their state
    pub fn len(&self) -> usize  {self.entries.len()}
    pub fn is_empty(&self) -> bool  {self.entries.is_empty()}

    fn allocate_tag(&mut self, handle: Handle) -> Option<u8> {
        for i in 0 .. TAGS {
            let tag = (self.next_tag + i) % TAGS;
            if self.tags[tag].is_none() {
                self.tags[tag] = Some(handle);
                self.next_tag = (tag + 1) % TAGS;
                return u8::try_from(tag).ok();
            }
        }
        None
    }
    fn release_tag(&mut self, handle: Handle) {
        if let Some(State::InFlight {tag, ..}) = self.entries.get(&handle).map(|entry| &entry.state) {
            let tag = usize::from(*tag);
            if self.tags[tag] == Some(handle) {
                self.tags[tag] = None;
            }
        }
    }
    fn retry_or_fail(&mut self, handle: Handle, error: EthercatError) {
        let Some(entry) = self.entries.get_mut(&handle)
            else {return};
        if entry.attempts <= entry.datagram.retries {
            self.stats.retries += 1;
            debug!("retrying datagram {:?} after {}", handle, error);
            entry.state = State::Queued;
            self.queued.insert(handle);
        }
        else {
            if let EthercatError::Timeout(_) = error {
                self.stats.timeouts += 1;
            }
            entry.state = State::Done(Err(error));
        }
    }
}



#[cfg(test)]
mod tests {
    use super::*;

    /// answer a frame the way a bus would do, setting every working counter
    fn echo(frame: &[u8], working_count: u16) -> Vec<u8> {
        let mut frame = frame.to_vec();
        let mut offset = 2;
        loop {
            let len = usize::from(u16::from_le_bytes([frame[offset+6], frame[offset+7]]) & 0x7ff);
            let next = frame[offset+7] & 0x80 != 0;
            let footer = offset + 10 + len;
            frame[footer .. footer+2].copy_from_slice(&working_count.to_le_bytes());
            offset = footer + 2;
            if ! next {break}
        }
        frame
    }

    fn datagram(i: usize, size: usize) -> Datagram {
        Datagram::new(PduCommand::FPRD, 0x1000 + i as u32, vec![i as u8; size])
    }

    #[test]
    fn batching_preserves_order() {
        let mut queue = DatagramQueue::new(1500);
        let handles: Vec<Handle> = (0 .. 40)
            .map(|i| queue.enqueue(datagram(i, 100)).unwrap())
            .collect();
        let now = Instant::now();
        let frames = queue.flush(now);

        assert!(frames.len() > 1);
        assert!(frames.iter().all(|frame| frame.data.len() <= 1500));
        assert_eq!(frames.iter().map(|frame| frame.handles.len()).sum::<usize>(), handles.len());
        let sent: Vec<Handle> = frames.iter().flat_map(|frame| frame.handles.clone()).collect();
        assert_eq!(sent, handles);
        assert!(! queue.has_queued());

        // frames come back in reverse order, completion is still reported in enqueue order
        for frame in frames.iter().rev() {
            assert_eq!(queue.receive(&echo(&frame.data, 1), now).unwrap(), Some(frame.id));
        }
        assert_eq!(queue.poll(now), handles);
        for (i, &handle) in handles.iter().enumerate() {
            let response = queue.take(handle).unwrap().unwrap();
            assert_eq!(response.working_count, 1);
            assert_eq!(response.data, vec![i as u8; 100]);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn timeout_after_retries() {
        let mut queue = DatagramQueue::new(1500);
        let handle = queue.enqueue(datagram(0, 2)
            .timeout(Duration::from_millis(1))
            .retries(2)
            ).unwrap();
        let mut now = Instant::now();
        for _ in 0 .. 3 {
            assert_eq!(queue.flush(now).len(), 1);
            assert!(queue.poll(now).is_empty());
            now += Duration::from_millis(2);
            queue.poll(now);
        }
        assert!(! queue.has_queued());
        assert!(matches!(queue.take(handle), Some(Err(EthercatError::Timeout(_)))));
        assert_eq!(queue.stats().retries, 2);
        assert_eq!(queue.stats().timeouts, 1);
    }

    #[test]
    fn corrupted_answer_is_retried() {
        let mut queue = DatagramQueue::new(1500);
        let handle = queue.enqueue(datagram(3, 4)).unwrap();
        let now = Instant::now();
        let frame = queue.flush(now).remove(0);

        let mut corrupted = echo(&frame.data, 1);
        // change the register address
        corrupted[2+5] ^= 0x01;
        queue.receive(&corrupted, now).unwrap();
        assert!(queue.poll(now).is_empty());
        assert_eq!(queue.stats().corrupted, 1);

        // the retry goes out in a new frame and completes normally
        let frame = queue.flush(now).remove(0);
        queue.receive(&echo(&frame.data, 1), now).unwrap();
        assert_eq!(queue.poll(now), vec![handle]);
        assert_eq!(queue.take(handle).unwrap().unwrap().data, vec![3; 4]);
    }

    #[test]
    fn stale_frames_are_discarded() {
        let mut queue = DatagramQueue::new(1500);
        let handle = queue.enqueue(datagram(1, 2).timeout(Duration::from_millis(1)).retries(0)).unwrap();
        let mut now = Instant::now();
        let frame = queue.flush(now).remove(0);
        now += Duration::from_millis(5);
        assert_eq!(queue.poll(now), vec![handle]);

        // the answer arrives after the deadline
        assert_eq!(queue.receive(&echo(&frame.data, 1), now).unwrap(), None);
        assert_eq!(queue.stats().stale, 1);
        assert!(matches!(queue.take(handle), Some(Err(EthercatError::Timeout(_)))));
    }

    #[test]
    fn abandoned_datagram_completes_silently() {
        let mut queue = DatagramQueue::new(1500);
        let kept = queue.enqueue(datagram(0, 2)).unwrap();
        let dropped = queue.enqueue(datagram(1, 2)).unwrap();
        let now = Instant::now();
        let frame = queue.flush(now).remove(0);
        queue.abandon(dropped);

        queue.receive(&echo(&frame.data, 1), now).unwrap();
        assert_eq!(queue.poll(now), vec![kept]);
        assert!(queue.take(kept).is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn oversized_datagram_is_refused() {
        let mut queue = DatagramQueue::new(100);
        assert!(queue.enqueue(datagram(0, 100)).is_err());
        assert!(queue.enqueue(datagram(0, queue.max_payload())).is_ok());
    }
}
