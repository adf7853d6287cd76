/*!
    low level ethercat communication functions.

    It wraps an ethercat socket to schedule, send and receive ethercat frames containing data or commands.
*/

use std::{
    time::Instant,
    sync::{Arc, Mutex, MutexGuard, Condvar, PoisonError},
    sync::atomic::{AtomicU32, AtomicBool, Ordering::*},
    };
use core::time::Duration;
use tokio::sync::Notify;
use log::*;

use crate::{
    socket::EthercatSocket,
    data::{Field, PduData, Storage},
    error::{EthercatError, EthercatResult},
    frame::{PduCommand, SlaveAddress, MAX_ETHERCAT_FRAME},
    queue::{DatagramQueue, Datagram, OutgoingFrame, Response, Latency, QueueStats},
    config::TransportConfig,
    };


/// maximum time the driver sleeps when it has nothing to do, so it can notice a stop request
const IDLE_WAIT: Duration = Duration::from_millis(50);

/**
    low level ethercat communication, executing datagrams with no notion of slave state

    Any [EthercatSocket] can carry the frames, see [crate::socket].

    A frame holds any number of datagrams, each one a command acting on one of two memories:

    - **physical memory**: the registers of each slave, declared in [crate::registers]. Position, fixed and broadcast commands (`AP*`, `FP*`, `B*`) address it.
    - **logical memory**: a memory space existing only on the wire. Logical commands (`L*`) read or write it, each slave contributing through its FMMU configuration.

    See [PduCommand] for the commands.

    Datagrams issued by async tasks are buffered in a [DatagramQueue] for at most the merge time, then sent by the transport driver, which must run in a dedicated thread (see [Self::spawn_driver]). The driver exchanges one frame at a time with the bus.
*/
pub struct RawMaster {
	/// acceptable delay time before sending buffered PDUs
	pdu_merge_time: Duration,
	/// maximum time waiting for a sent frame to come back
	receive_timeout: Duration,
	/// default datagram settings
	response_timeout: Duration,
	retries: u8,
	link_down_after: u32,

	// socket implementation
	socket: Box<dyn EthercatSocket + Send + Sync>,
	// synchronization signal for multitask reception
	received: Notify,
	sendable: Condvar,

	// communication state
    // states are locked using [std::sync::Mutex] since it is recommended by async-io
    // they should not be held for too long (and never during blocking operations) so they shouldn't disturb the async runtime too much
	queue: Mutex<DatagramQueue>,
	ethercat_receive: Mutex<Vec<u8>>,

	/// consecutive frames lost or not sent
	failures: AtomicU32,
	stopped: AtomicBool,
}

impl RawMaster {
	pub fn new<S: EthercatSocket + 'static + Send + Sync>(socket: S) -> Self {
        Self::with_config(socket, &TransportConfig::default())
	}
	pub fn with_config<S: EthercatSocket + 'static + Send + Sync>(socket: S, config: &TransportConfig) -> Self {
        let max_frame = socket.max_frame().min(MAX_ETHERCAT_FRAME);
        Self {
            pdu_merge_time: config.merge_time,
            receive_timeout: config.receive_timeout,
            response_timeout: config.response_timeout,
            retries: config.retries,
            link_down_after: config.link_down_after.max(1),

            socket: Box::new(socket),
            received: Notify::new(),
            sendable: Condvar::new(),

            queue: Mutex::new(DatagramQueue::new(max_frame)),
            ethercat_receive: Mutex::new(vec![0; MAX_ETHERCAT_FRAME]),

            failures: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
        }
	}

	/// lock the datagram queue, it remains usable if a task panicked while holding it
	fn queue(&self) -> MutexGuard<'_, DatagramQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
	}

	// shorthands to PDU commands
	// the slave address is actually packed and unpacked to actual commands again, but this is greatly shortening the code and the compiler should optimize that
	pub async fn brd<T: PduData>(&self, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::Broadcast, address).await
	}
	pub async fn bwr<T: PduData>(&self, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::Broadcast, address, data).await
	}

	pub async fn aprd<T: PduData>(&self, slave: u16, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::AutoIncremented(slave), address).await
	}
	pub async fn apwr<T: PduData>(&self, slave: u16, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::AutoIncremented(slave), address, data).await
	}

	pub async fn fprd<T: PduData>(&self, slave: u16, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::Fixed(slave), address).await
	}
	pub async fn fpwr<T: PduData>(&self, slave: u16, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::Fixed(slave), address, data).await
	}
	/// fixed slave read multiple write: the given slave is read, and all the others write the read value
	pub async fn frmw<T: PduData>(&self, slave: u16, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.command(PduCommand::FRMW, SlaveAddress::Fixed(slave), address, None).await
	}

	/// auto-incremented slave read multiple write: the slave at the given position is read, and all the others write the read value
	pub async fn armw<T: PduData>(&self, slave: u16, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.command(PduCommand::ARMW, SlaveAddress::AutoIncremented(slave), address, None).await
	}

	pub async fn lrd<T: PduData>(&self, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::Logical, address).await
	}
	pub async fn lwr<T: PduData>(&self, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::Logical, address, data).await
	}
	pub async fn lrw<T: PduData>(&self, address: Field<T>, data: T) -> EthercatResult<PduAnswer<T>> {
        self.exchange(SlaveAddress::Logical, address, data).await
	}

	/// maps to a *rd command
	pub async fn read<T: PduData>(&self, slave: SlaveAddress, memory: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.command(slave.read(), slave, memory, None).await
    }
	/// maps to a *wr command
	pub async fn write<T: PduData>(&self, slave: SlaveAddress, memory: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        let answer = self.command(slave.write(), slave, memory, Some(data)).await?;
        Ok(PduAnswer {answers: answer.answers, value: ()})
	}
	/// maps to a *rw command
	pub async fn exchange<T: PduData>(&self, slave: SlaveAddress, memory: Field<T>, data: T) -> EthercatResult<PduAnswer<T>> {
        self.command(slave.exchange(), slave, memory, Some(data)).await
	}

	async fn command<T: PduData>(&self, command: PduCommand, slave: SlaveAddress, memory: Field<T>, data: Option<T>) -> EthercatResult<PduAnswer<T>> {
        let mut buffer = T::Packed::zeroed();
        if let Some(data) = data {
            data.pack(buffer.as_mut())?;
        }
        let len = memory.len.min(buffer.as_ref().len());
        let answers = self.pdu(command, slave.datagram(memory.byte as u32), &mut buffer.as_mut()[.. len]).await?;
        Ok(PduAnswer {
            answers,
            value: T::unpack(buffer.as_ref())?,
            })
	}

	/**
        send a PDU on the ethercat bus, the PDU is buffered with more PDUs if possible

        the answer overwrites the given data, and the number of slaves who processed the command is returned
    */
	pub async fn pdu(&self, command: PduCommand, address: u32, data: &mut [u8]) -> EthercatResult<u16> {
        let response = self.transmit(
            Datagram::new(command, address, data.to_vec())
                .timeout(self.response_timeout)
                .retries(self.retries)
            ).await?;
        data.copy_from_slice(&response.data);
        Ok(response.working_count)
	}

	/**
        send a datagram with its own deadline and retry budget, and wait for its answer

        Dropping the returned future does not cancel the datagram if already sent, its answer is simply discarded
    */
	pub async fn transmit(&self, datagram: Datagram) -> EthercatResult<Response> {
        let handle = self.queue().enqueue(datagram)?;
        self.sendable.notify_one();
        // clean up the queue in case the async runtime cancels this task
        let _finisher = Finisher::new(|| self.queue().abandon(handle));

        loop {
            let mut notified = std::pin::pin!(self.received.notified());
            // register before checking, so a completion between the check and the await is not missed
            notified.as_mut().enable();
            if let Some(result) = self.queue().take(handle) {
                return result;
            }
            notified.await;
        }
	}

	/**
        this is the transport driver step, it sends the datagrams waiting and processes the answers

        It blocks until some datagrams are available or some deadline is passed, it is meant to be called in loop by a dedicated thread
    */
	pub fn step(&self) {
        let pending = {
            let queue = self.queue();
            if queue.has_queued()
                {true}
            else {
                let wait = queue.next_deadline()
                    .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                    .unwrap_or(IDLE_WAIT)
                    .min(IDLE_WAIT);
                let (queue, _) = self.sendable.wait_timeout(queue, wait)
                    .unwrap_or_else(PoisonError::into_inner);
                queue.has_queued()
            }
        };
        if pending && ! self.pdu_merge_time.is_zero() {
            // let concurrent tasks add their datagrams to the same frame
            std::thread::sleep(self.pdu_merge_time);
        }

        let frames = self.queue().flush(Instant::now());
        for frame in &frames {
            self.exchange_frame(frame);
        }
        let completed = self.queue().poll(Instant::now());
        if ! completed.is_empty() {
            self.received.notify_waiters();
        }
	}

	/// send one frame and receive until it comes back or the receive timeout is reached
	fn exchange_frame(&self, frame: &OutgoingFrame) {
        if let Err(error) = self.socket.send(&frame.data) {
            self.link_failure(&format!("cannot send frame: {}", error));
            self.queue().transport_failed(frame);
            return;
        }
        let mut buffer = self.ethercat_receive.lock().unwrap_or_else(PoisonError::into_inner);
        let deadline = Instant::now() + self.receive_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.link_failure("frame lost");
                return;
            }
            match self.socket.receive(&mut buffer, remaining) {
                Ok(Some(size)) => {
                    match self.queue().receive(&buffer[.. size], Instant::now()) {
                        Ok(Some(id)) if id == frame.id => {
                            self.failures.store(0, Relaxed);
                            return;
                        },
                        // an older frame coming late, or a frame not intended for us
                        Ok(_) => continue,
                        Err(error) => {
                            warn!("dropping malformed frame: {}", error);
                            continue;
                        },
                    }
                },
                Ok(None) => {
                    self.link_failure("frame lost");
                    return;
                },
                Err(error) => {
                    self.link_failure(&format!("cannot receive frame: {}", error));
                    self.queue().transport_failed(frame);
                    return;
                },
            }
        }
	}

	fn link_failure(&self, reason: &str) {
        let failures = self.failures.fetch_add(1, Relaxed) + 1;
        if failures == self.link_down_after {
            error!("transport down after {} consecutive failures: {}", failures, reason);
        }
        else {
            debug!("transport failure: {}", reason);
        }
	}

	/// run the transport driver until [Self::stop] is called
	pub fn run(&self) {
        while ! self.stopped.load(Relaxed) {
            self.step();
        }
	}
	/// request the transport driver to stop, datagrams sent afterward will never complete
	pub fn stop(&self) {
        self.stopped.store(true, Relaxed);
        self.sendable.notify_all();
	}
	/**
        start the transport driver in a new thread

        if `realtime` is set, the thread is given the realtime scheduling policy and IO priority when the system permits it
    */
	pub fn spawn_driver(self: &Arc<Self>, realtime: bool) -> std::thread::JoinHandle<()> {
        let master = self.clone();
        std::thread::spawn(move || {
            if realtime {
                set_realtime();
            }
            master.run()
        })
	}

	/// false when too many consecutive frames could not be exchanged
	pub fn link_up(&self) -> bool {
        self.failures.load(Relaxed) < self.link_down_after
	}
	/// round trip time of frames
	pub fn latency(&self) -> Latency  {self.queue().latency()}
	pub fn stats(&self) -> QueueStats  {self.queue().stats()}
	/// maximum frame size used on the socket
	pub fn max_frame(&self) -> usize  {self.queue().max_frame()}
	/// default deadline of datagrams
	pub fn response_timeout(&self) -> Duration  {self.response_timeout}
}

#[cfg(target_os = "linux")]
fn set_realtime() {
    use thread_priority::*;
    if let Err(error) = set_thread_priority_and_policy(
            thread_native_id(),
            ThreadPriority::Max,
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
            ) {
        warn!("cannot set realtime priority to transport driver: {:?}", error);
    }
    if let Err(error) = ioprio::set_priority(
            ioprio::Target::Process(ioprio::Pid::this()),
            ioprio::Priority::new(ioprio::Class::Realtime(ioprio::RtPriorityLevel::highest())),
            ) {
        warn!("cannot set realtime io priority to transport driver: {}", error);
    }
}
#[cfg(not(target_os = "linux"))]
fn set_realtime() {
    warn!("realtime priority is not supported on this platform");
}


/// answer to a PDU: the value read and the number of slaves which processed it
#[derive(Clone, Debug)]
pub struct PduAnswer<T> {
	pub answers: u16,
	pub value: T,
}
impl<T> PduAnswer<T> {
    /// the value, if exactly one slave answered
    pub fn one(self) -> EthercatResult<T> {
        self.exact(1)
    }
    /// the value, if exactly `n` slaves answered
    pub fn exact(self, n: u16) -> EthercatResult<T> {
        match self.answers {
            0 if n != 0 => Err(EthercatError::Protocol("no slave answered")),
            answers if answers == n => Ok(self.value),
            _ => Err(EthercatError::Protocol("unexpected number of slaves answered")),
        }
    }
    /// the value, whatever the number of slaves answering
    pub fn value(self) -> T  {self.value}
}


/// call a function when dropped, used to clean up when a task is cancelled
struct Finisher<F: FnOnce()> {
    callback: Option<F>,
}
impl<F: FnOnce()> Finisher<F> {
    fn new(callback: F) -> Self {Self{callback: Some(callback)}}
}
impl<F: FnOnce()>
Drop for Finisher<F>  {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}



#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registers,
        socket::{SimulatedBus, SimulatedSlave},
        };

    #[tokio::test]
    async fn concurrent_datagrams() {
        let bus = SimulatedBus::new();
        for i in 0 .. 3 {
            bus.push(SimulatedSlave::new(0x2, 0x100 + i));
        }
        let master = Arc::new(RawMaster::new(bus.socket()));
        let driver = master.spawn_driver(false);

        let (station0, station2) = futures_concurrency::future::Join::join((
            master.apwr(0, registers::address::fixed, 0x1000),
            master.apwr(2, registers::address::fixed, 0x1002),
            )).await;
        station0.unwrap().one().unwrap();
        station2.unwrap().one().unwrap();

        assert_eq!(master.fprd(0x1002, registers::address::fixed).await.unwrap().one().unwrap(), 0x1002);
        assert_eq!(master.brd(registers::al::status).await.unwrap().answers, 3);
        assert!(master.fprd(0x1001, registers::address::fixed).await.unwrap().one().is_err());
        assert!(master.link_up());

        master.stop();
        driver.join().unwrap();
    }

    #[tokio::test]
    async fn lost_frames_are_retried() {
        let bus = SimulatedBus::new();
        bus.push(SimulatedSlave::new(0x2, 0x100));
        let config = TransportConfig {
            response_timeout: Duration::from_millis(5),
            receive_timeout: Duration::from_millis(5),
            link_down_after: 3,
            ..Default::default()
            };
        let master = Arc::new(RawMaster::with_config(bus.socket(), &config));
        let driver = master.spawn_driver(false);

        bus.lose_frames(2);
        assert_eq!(master.brd(registers::al::status).await.unwrap().answers, 1);
        assert!(master.stats().retries >= 2);

        bus.lose_frames(10);
        assert!(matches!(
            master.brd(registers::al::status).await,
            Err(EthercatError::Timeout(_)),
            ));
        assert!(! master.link_up());

        master.stop();
        driver.join().unwrap();
    }
}
