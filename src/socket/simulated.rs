/*!
    In-memory ethercat segment, answering frames the way a chain of slaves would.

    Each simulated slave has its physical memory, an EEPROM generated from its description, and implements the behaviors of a slave controller the master relies on: addressing modes, AL state transitions, EEPROM reads through the SII registers, FMMU mapping of the logical memory, and an echoing mailbox. Faults can be injected in the segment to test how the master copes with them.
*/

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
    io,
    };
use core::time::Duration;
use bilge::prelude::*;
use log::*;

use super::EthercatSocket;
use crate::{
    data::{PduData, Field},
    frame::{EthercatHeader, PduHeader, PduCommand, ETHERCAT_TYPE_PDU, MAX_ETHERCAT_FRAME},
    registers::{self, AlState, SyncManagerChannel},
    eeprom::{self, CategoryType, FmmuUsage, SyncManagerUsage, SyncManagerEntry, PdoHeader, PdoEntry, WORD},
    };


/// size of the physical memory of a simulated slave
const MEMORY: usize = 0x2000;
/// physical address of the master to slave mailbox
pub const SIMULATED_MAILBOX_OUT: u16 = 0x1000;
/// physical address of the slave to master mailbox
pub const SIMULATED_MAILBOX_IN: u16 = 0x1080;
/// size of each mailbox buffer
pub const SIMULATED_MAILBOX_SIZE: u16 = 0x80;
/// physical address of the outputs buffer
pub const SIMULATED_OUTPUTS: u16 = 0x1100;
/// physical address of the inputs buffer
pub const SIMULATED_INPUTS: u16 = 0x1180;
/// size of process data buffers
const PROCESS_MAX: u16 = 0x80;

/// byte of the sync manager status in a sync manager channel
const SM_STATUS: usize = 5;
/// bit of [SM_STATUS] telling a mailbox is full
const SM_MAILBOX_FULL: u8 = 0b1000;


/// description of a simulated slave
#[derive(Clone, Debug)]
pub struct SimulatedSlave {
    pub vendor: u32,
    pub product: u32,
    pub revision: u32,
    pub serial: u32,
    /// station alias stored in the EEPROM
    pub alias: u16,
    /// the slave has mailbox sync managers
    pub mailbox: bool,
    /// bytes of process data received from the master
    pub outputs: u16,
    /// bytes of process data sent to the master
    pub inputs: u16,
    /// the slave supports LRW
    pub logical_exchange: bool,
    pub distributed_clock: bool,
}
impl SimulatedSlave {
    pub fn new(vendor: u32, product: u32) -> Self {
        Self {
            vendor,
            product,
            revision: 1,
            serial: 0,
            alias: 0,
            mailbox: true,
            outputs: 4,
            inputs: 4,
            logical_exchange: true,
            distributed_clock: false,
        }
    }
    pub fn revision(mut self, revision: u32) -> Self  {self.revision = revision; self}
    pub fn serial(mut self, serial: u32) -> Self  {self.serial = serial; self}
    pub fn alias(mut self, alias: u16) -> Self  {self.alias = alias; self}
    pub fn without_mailbox(mut self) -> Self  {self.mailbox = false; self}
    pub fn without_logical_exchange(mut self) -> Self  {self.logical_exchange = false; self}
    pub fn with_distributed_clock(mut self) -> Self  {self.distributed_clock = true; self}
    /// sizes of outputs and inputs, each is limited to 128 bytes
    pub fn process(mut self, outputs: u16, inputs: u16) -> Self {
        self.outputs = outputs.min(PROCESS_MAX);
        self.inputs = inputs.min(PROCESS_MAX);
        self
    }

    /// content of the EEPROM of this slave
    pub fn eeprom(&self) -> Vec<u8> {
        let mut image = vec![0; eeprom::HEADER_SIZE];
        let header = |image: &mut Vec<u8>| -> crate::data::PackingResult<()> {
            eeprom::address_alias.set(image, self.alias)?;
            eeprom::device::vendor.set(image, self.vendor)?;
            eeprom::device::product.set(image, self.product)?;
            eeprom::device::revision.set(image, self.revision)?;
            eeprom::device::serial_number.set(image, self.serial)?;
            if self.mailbox {
                eeprom::mailbox::receive::offset.set(image, SIMULATED_MAILBOX_OUT)?;
                eeprom::mailbox::receive::size.set(image, SIMULATED_MAILBOX_SIZE)?;
                eeprom::mailbox::send::offset.set(image, SIMULATED_MAILBOX_IN)?;
                eeprom::mailbox::send::size.set(image, SIMULATED_MAILBOX_SIZE)?;
                // CoE
                Field::<u16>::simple(eeprom::mailbox::protocols.byte).set(image, 0x0004)?;
            }
            eeprom::eeprom_size.set(image, 1)?;
            eeprom::version.set(image, 1)?;
            Ok(())
        };
        if let Err(error) = header(&mut image) {
            error!("cannot generate simulated eeprom header: {:?}", error);
        }

        // strings are indexed from 1
        let strings: [&[u8]; 2] = [b"SIM", b"simulated slave"];
        let mut content = vec![strings.len() as u8];
        for string in strings {
            content.push(string.len() as u8);
            content.extend_from_slice(string);
        }
        category(&mut image, CategoryType::Strings, &content);

        let mut general = vec![0; eeprom::general::SIZE];
        general[eeprom::general::NAME] = 2;
        general[eeprom::general::FLAGS] = eeprom::general::ENABLE_SAFEOP
            | if self.logical_exchange {0} else {eeprom::general::ENABLE_NOT_LRW};
        category(&mut image, CategoryType::General, &general);

        category(&mut image, CategoryType::Fmmu, &[
            u8::from(FmmuUsage::Outputs),
            u8::from(FmmuUsage::Inputs),
            u8::from(FmmuUsage::MailboxState),
            u8::from(FmmuUsage::Unused),
            ]);

        let mailbox_size = if self.mailbox {SIMULATED_MAILBOX_SIZE} else {0};
        let channels = [
            (SIMULATED_MAILBOX_OUT, mailbox_size, 0x26, SyncManagerUsage::MailboxOut),
            (SIMULATED_MAILBOX_IN, mailbox_size, 0x22, SyncManagerUsage::MailboxIn),
            (SIMULATED_OUTPUTS, self.outputs, 0x64, SyncManagerUsage::ProcessOut),
            (SIMULATED_INPUTS, self.inputs, 0x20, SyncManagerUsage::ProcessIn),
            ];
        let mut content = vec![0; channels.len() * SyncManagerEntry::packed_size()];
        for (i, &(address, length, control, usage)) in channels.iter().enumerate() {
            let entry = SyncManagerEntry {
                address,
                length,
                control,
                status: 0,
                enable: u8::from(length != 0),
                usage: u8::from(usage),
                };
            if let Err(error) = entry.pack(&mut content[i * SyncManagerEntry::packed_size() ..]) {
                error!("cannot generate simulated sync manager entry: {:?}", error);
            }
        }
        category(&mut image, CategoryType::SyncManager, &content);

        category(&mut image, CategoryType::RxPdo, &pdo(0x1600, 2, 0x7000, self.outputs));
        category(&mut image, CategoryType::TxPdo, &pdo(0x1a00, 3, 0x6000, self.inputs));

        image.extend_from_slice(&0xffffu16.to_le_bytes());
        image.extend_from_slice(&0u16.to_le_bytes());
        image
    }
}

/// append a category to an EEPROM image, padded to words
fn category(image: &mut Vec<u8>, ty: CategoryType, content: &[u8]) {
    let words = (content.len() + WORD - 1) / WORD;
    image.extend_from_slice(&(ty as u16).to_le_bytes());
    image.extend_from_slice(&(words as u16).to_le_bytes());
    image.extend_from_slice(content);
    image.resize(image.len() + words * WORD - content.len(), 0);
}

/// PDO category content with one byte entry per byte of process data
fn pdo(index: u16, sync_manager: u8, entries: u16, size: u16) -> Vec<u8> {
    let mut content = vec![0; PdoHeader::packed_size() + usize::from(size) * PdoEntry::packed_size()];
    let header = PdoHeader {
        index,
        entries: size as u8,
        sync_manager,
        ..Default::default()
        };
    let mut result = header.pack(&mut content);
    for i in 0 .. size {
        let entry = PdoEntry {
            index: entries,
            sub: (i + 1) as u8,
            dtype: 5,  // UNSIGNED8
            bitlen: 8,
            ..Default::default()
            };
        result = result.and_then(|_| entry.pack(&mut content[
            PdoHeader::packed_size() + usize::from(i) * PdoEntry::packed_size() ..
            ]));
    }
    if let Err(error) = result {
        error!("cannot generate simulated pdo: {:?}", error);
    }
    content
}


/// fault injected on a simulated slave
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlaveFault {
    /// the slave forwards frames but never processes them
    Silent,
    /// the link is broken before this slave, it and the following slaves are unreachable
    LinkBroken,
    /// state requests are accepted but the slave stays in its current state
    StateStuck,
    /// every EEPROM read is refused with a command error
    EepromFailure,
}

/// state of a simulated slave
struct Device {
    model: SimulatedSlave,
    memory: Vec<u8>,
    eeprom: Vec<u8>,
    fault: Option<SlaveFault>,
    /// one time failure of a transition to a state, with the status code to report
    failure: Option<(AlState, u16)>,
    /// number of process data exchanges to ignore
    missed: u32,
    /// word addresses of the EEPROM reads received
    sii_reads: Vec<u16>,
    start: Instant,
}

impl Device {
    fn new(model: SimulatedSlave) -> Self {
        let mut memory = vec![0; MEMORY];
        let mut information = registers::DLInformation::default();
        information.set_ty(0x11);
        information.set_fmmus(8);
        information.set_sync_managers(8);
        information.set_ram_size(8);
        information.set_ports(0b1111);
        information.set_dc_supported(model.distributed_clock);
        information.set_dc_range(model.distributed_clock);
        information.set_logical_exchange_not_supported(! model.logical_exchange);
        let mut control = registers::SiiControl::default();
        control.set_read_size(registers::SiiTransaction::Bytes8);
        control.set_address_unit(registers::SiiUnit::Word);

        let result = registers::dl::information.set(&mut memory, information)
            .and_then(|_| registers::address::alias.set(&mut memory, model.alias))
            .and_then(|_| registers::sii::control.set(&mut memory, control));
        if let Err(error) = result {
            error!("cannot initialize simulated slave: {:?}", error);
        }
        let eeprom = model.eeprom();
        let mut device = Self {
            model,
            memory,
            eeprom,
            fault: None,
            failure: None,
            missed: 0,
            sii_reads: Vec::new(),
            start: Instant::now(),
        };
        device.set_status(AlState::Init, false, 0);
        device
    }

    fn station(&self) -> u16 {
        u16::from_le_bytes([self.memory[0x10], self.memory[0x11]])
    }
    fn state(&self) -> u8  {self.memory[registers::al::status.byte] & 0x0f}
    fn set_status(&mut self, state: AlState, error: bool, code: u16) {
        self.memory[registers::al::status.byte] = u4::from(state).value() | if error {0x10} else {0};
        let code_at = registers::al::error.byte;
        self.memory[code_at .. code_at + 2].copy_from_slice(&code.to_le_bytes());
    }
    fn channel(&self, index: u8) -> Option<SyncManagerChannel> {
        registers::sync_manager::interface.channel(index).get(&self.memory).ok()
    }
    fn channel_enabled(&self, index: u8) -> bool {
        self.channel(index).map_or(false, |channel| channel.enable() && channel.length() != 0)
    }

    /// execute a datagram on this slave, returns the working count increment
    fn execute(&mut self, command: PduCommand, address: &mut u32, data: &mut [u8]) -> u16 {
        let position = *address as u16;
        let register = (*address >> 16) as usize;
        if command.position_addressed() {
            *address = (*address & 0xffff_0000) | u32::from(position.wrapping_add(1));
        }
        if self.fault == Some(SlaveFault::Silent)
            {return 0}

        use PduCommand::*;
        match command {
            APRD | APWR | APRW | ARMW => {
                let addressed = position == 0;
                self.physical(command, addressed, register, data)
            },
            FPRD | FPWR | FPRW | FRMW => {
                let addressed = position == self.station();
                self.physical(command, addressed, register, data)
            },
            BRD => self.read(register, data, true),
            BWR => self.write(register, data),
            BRW => {
                let sent = data.to_vec();
                let read = self.read(register, data, true);
                read + 2 * self.write(register, &sent)
            },
            LRD | LWR | LRW => self.logical(command, *address, data),
            NOP => 0,
        }
    }

    fn physical(&mut self, command: PduCommand, addressed: bool, register: usize, data: &mut [u8]) -> u16 {
        use PduCommand::*;
        match (command, addressed) {
            (APRD | FPRD, true) => self.read(register, data, false),
            (APWR | FPWR, true) => self.write(register, data),
            (APRW | FPRW, true) => {
                let sent = data.to_vec();
                let read = self.read(register, data, false);
                read + 2 * self.write(register, &sent)
            },
            (ARMW | FRMW, true) => self.read(register, data, false),
            (ARMW | FRMW, false) => self.write(register, data),
            _ => 0,
        }
    }

    /// read physical memory into the datagram
    fn read(&mut self, register: usize, data: &mut [u8], combine: bool) -> u16 {
        let end = register + data.len();
        if end > self.memory.len()
            {return 0}
        if self.model.distributed_clock {
            let system = registers::dc::system_time;
            if register < system.byte + system.len && system.byte < end {
                let time = self.start.elapsed().as_nanos() as u64;
                self.memory[system.byte .. system.byte + system.len].copy_from_slice(&time.to_le_bytes());
            }
        }
        // the slave to master mailbox can only be read when full
        let mailbox = self.channel(1).filter(|_| self.channel_enabled(1));
        if let Some(mailbox) = mailbox {
            let last = usize::from(mailbox.address()) + usize::from(mailbox.length()) - 1;
            if register <= last && last < end {
                let status = registers::sync_manager::interface.channel(1).byte + SM_STATUS;
                if self.memory[status] & SM_MAILBOX_FULL == 0
                    {return 0}
                self.memory[status] &= ! SM_MAILBOX_FULL;
            }
        }
        let memory = &self.memory[register .. end];
        if combine {
            for (dst, src) in data.iter_mut().zip(memory) {
                *dst |= *src;
            }
        }
        else {
            data.copy_from_slice(memory);
        }
        1
    }

    /// write the datagram into physical memory, and trigger the slave reactions
    fn write(&mut self, register: usize, data: &[u8]) -> u16 {
        let end = register + data.len();
        if end > self.memory.len()
            {return 0}
        let covers = |field_byte: usize| register <= field_byte && field_byte < end;
        // status registers are read only
        let status = registers::al::status.byte .. registers::al::error.byte + 2;
        for (i, &byte) in data.iter().enumerate() {
            if ! status.contains(&(register + i)) {
                self.memory[register + i] = byte;
            }
        }

        if covers(registers::al::control.byte) {
            let request = self.memory[registers::al::control.byte];
            self.request(request);
        }
        if covers(registers::sii::control.byte + 1) {
            self.sii_operation();
        }
        let mailbox = self.channel(0).filter(|_| self.channel_enabled(0));
        if let Some(mailbox) = mailbox {
            let last = usize::from(mailbox.address()) + usize::from(mailbox.length()) - 1;
            if covers(last) {
                self.mailbox_received(mailbox);
            }
        }
        1
    }

    /// exchange with the logical memory through the FMMUs
    fn logical(&mut self, command: PduCommand, address: u32, data: &mut [u8]) -> u16 {
        if command == PduCommand::LRW && ! self.model.logical_exchange
            {return 0}
        let state = self.state();
        let start = u64::from(address);
        let end = start + data.len() as u64;
        let sent = data.to_vec();
        let (mut read, mut written, mut touched) = (false, false, false);

        for index in 0 .. registers::fmmu::interface.num {
            let Ok(entry) = registers::fmmu::interface.entry(index).get(&self.memory)
                else {continue};
            if ! entry.enable()  {continue}
            let logical = u64::from(entry.logical_start_byte());
            let overlap_start = start.max(logical);
            let overlap_end = end.min(logical + u64::from(entry.logical_len_byte()));
            if overlap_start >= overlap_end  {continue}
            touched = true;
            if self.missed > 0  {continue}

            let len = (overlap_end - overlap_start) as usize;
            let in_datagram = (overlap_start - start) as usize;
            let physical = usize::from(entry.physical_start_byte()) + (overlap_start - logical) as usize;
            if physical + len > self.memory.len()  {continue}

            if entry.write() && command != PduCommand::LRD && state == u4::from(AlState::Operational).value() {
                self.memory[physical .. physical + len].copy_from_slice(&sent[in_datagram .. in_datagram + len]);
                written = true;
            }
            if entry.read() && command != PduCommand::LWR && state >= u4::from(AlState::SafeOperational).value() {
                data[in_datagram .. in_datagram + len].copy_from_slice(&self.memory[physical .. physical + len]);
                read = true;
            }
        }
        if touched && self.missed > 0 {
            self.missed -= 1;
            return 0;
        }
        match command {
            PduCommand::LRW => u16::from(read) + 2 * u16::from(written),
            _ => u16::from(read || written),
        }
    }

    /// AL control register written
    fn request(&mut self, request: u8) {
        let requested = request & 0x0f;
        let acknowledge = request & 0x10 != 0;
        let current = self.state();
        let error = self.memory[registers::al::status.byte] & 0x10 != 0;
        let Ok(current) = AlState::try_from(u4::new(current))
            else {return};
        if error && ! acknowledge
            {return}
        if self.fault == Some(SlaveFault::StateStuck)
            {return}

        let target = match AlState::try_from(u4::new(requested)) {
            Ok(target) => target,
            Err(_) => return self.set_status(current, true, 0x12),
        };
        if let Some((failing, code)) = self.failure {
            if failing == target {
                self.failure = None;
                debug!("simulated slave refuses {:?} with code {:#x}", target, code);
                return self.set_status(current, true, code);
            }
        }
        use AlState::*;
        let code = match (current, target) {
            (_, Bootstrap) => 0x13,
            (_, Init) => 0,
            (Init, PreOperational) => {
                if self.model.mailbox && ! (self.channel_enabled(0) && self.channel_enabled(1))
                    {0x16} else {0}
            },
            (PreOperational, SafeOperational) => {
                if self.model.outputs != 0 && ! self.channel_enabled(2)
                    {0x1d}
                else if self.model.inputs != 0 && ! self.channel_enabled(3)
                    {0x1e}
                else {0}
            },
            (SafeOperational, Operational) => 0,
            (current, target) if u4::from(target).value() <= u4::from(current).value() => 0,
            _ => 0x11,
        };
        if code == 0 {
            self.set_status(target, false, 0);
        }
        else {
            self.set_status(current, true, code);
        }
    }

    /// SII control register written
    fn sii_operation(&mut self) {
        let Ok(mut control) = registers::sii::control.get(&self.memory)
            else {return};
        if ! control.read_operation()  {return}
        if self.fault == Some(SlaveFault::EepromFailure) {
            control.set_read_operation(false);
            control.set_busy(false);
            control.set_command_error(true);
            if let Err(error) = registers::sii::control.set(&mut self.memory, control) {
                error!("simulated sii failure: {:?}", error);
            }
            return;
        }
        let word = u16::from_le_bytes([self.memory[0x504], self.memory[0x505]]);
        self.sii_reads.push(word);
        let start = usize::from(word) * WORD;
        let data = registers::sii::data;
        for i in 0 .. data.len {
            self.memory[data.byte + i] = self.eeprom.get(start + i).copied().unwrap_or(0xff);
        }
        control.set_read_operation(false);
        control.set_busy(false);
        control.set_command_error(false);
        if let Err(error) = registers::sii::control.set(&mut self.memory, control) {
            error!("simulated sii failure: {:?}", error);
        }
    }

    /// the master to slave mailbox has been completely written, the message is echoed in the slave to master mailbox
    fn mailbox_received(&mut self, received: SyncManagerChannel) {
        let Some(answer) = self.channel(1).filter(|_| self.channel_enabled(1))
            else {return};
        let len = usize::from(received.length().min(answer.length()));
        let src = usize::from(received.address());
        let dst = usize::from(answer.address());
        self.memory.copy_within(src .. src + len, dst);
        let status = registers::sync_manager::interface.channel(1).byte + SM_STATUS;
        self.memory[status] |= SM_MAILBOX_FULL;
    }
}

/// the chain of simulated slaves
struct Segment {
    devices: Vec<Device>,
    /// frames returned by the chain, waiting to be received
    pending: VecDeque<Vec<u8>>,
    /// number of next frames to lose
    lost: u32,
    /// the transport refuses to send
    down: bool,
}

impl Segment {
    /// pass a frame through the chain, returns false if the frame is not a valid ethercat frame
    fn process(&mut self, frame: &mut [u8]) -> bool {
        let Ok(header) = EthercatHeader::unpack(frame)
            else {return false};
        if header.ty().value() != ETHERCAT_TYPE_PDU
            {return false}
        let end = (EthercatHeader::packed_size() + usize::from(header.len().value())).min(frame.len());
        let reachable = self.devices.iter()
            .position(|device| device.fault == Some(SlaveFault::LinkBroken))
            .unwrap_or(self.devices.len());

        let mut offset = EthercatHeader::packed_size();
        while offset + PduHeader::packed_size() <= end {
            let Ok(mut pdu) = PduHeader::unpack(&frame[offset ..])
                else {return false};
            let start = offset + PduHeader::packed_size();
            let footer = start + usize::from(pdu.len().value());
            if footer + 2 > end
                {return false}
            let command = PduCommand::from(pdu.command());
            let mut address = pdu.address();
            let mut working_count = u16::from_le_bytes([frame[footer], frame[footer+1]]);
            for device in &mut self.devices[.. reachable] {
                working_count = working_count.wrapping_add(
                    device.execute(command, &mut address, &mut frame[start .. footer]));
            }
            pdu.set_address(address);
            if pdu.pack(&mut frame[offset ..]).is_err()
                {return false}
            frame[footer .. footer + 2].copy_from_slice(&working_count.to_le_bytes());

            offset = footer + 2;
            if ! pdu.next()  {break}
        }
        true
    }
}

/**
    handle to a simulated segment of slaves

    Clones share the same segment, so a test can inject faults and inspect the slaves while the master is using the socket.
*/
#[derive(Clone)]
pub struct SimulatedBus {
    segment: Arc<Mutex<Segment>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self {segment: Arc::new(Mutex::new(Segment {
            devices: Vec::new(),
            pending: VecDeque::new(),
            lost: 0,
            down: false,
            }))}
    }
    fn segment(&self) -> MutexGuard<'_, Segment> {
        self.segment.lock().unwrap_or_else(PoisonError::into_inner)
    }
    /// socket sending frames to this segment
    pub fn socket(&self) -> SimulatedSocket {
        SimulatedSocket {bus: self.clone()}
    }

    /// add a slave at the end of the chain
    pub fn push(&self, slave: SimulatedSlave) {
        self.segment().devices.push(Device::new(slave));
    }
    /// replace the slave at the given position by a new device, in its initial state
    pub fn replace(&self, position: u16, slave: SimulatedSlave) {
        if let Some(device) = self.segment().devices.get_mut(usize::from(position)) {
            *device = Device::new(slave);
        }
    }
    /// remove a slave from the chain, the following slaves get closer to the master
    pub fn remove(&self, position: u16) {
        let mut segment = self.segment();
        if usize::from(position) < segment.devices.len() {
            segment.devices.remove(usize::from(position));
        }
    }
    pub fn len(&self) -> usize  {self.segment().devices.len()}

    /// inject or clear a fault on a slave
    pub fn set_fault(&self, position: u16, fault: Option<SlaveFault>) {
        if let Some(device) = self.segment().devices.get_mut(usize::from(position)) {
            device.fault = fault;
        }
    }
    /// the next request of the given state on the given slave will be refused with this AL status code
    pub fn fail_transition(&self, position: u16, target: AlState, code: u16) {
        if let Some(device) = self.segment().devices.get_mut(usize::from(position)) {
            device.failure = Some((target, code));
        }
    }
    /// the given slave ignores its next process data exchanges
    pub fn miss_exchanges(&self, position: u16, count: u32) {
        if let Some(device) = self.segment().devices.get_mut(usize::from(position)) {
            device.missed = count;
        }
    }
    /// the next frames sent are lost
    pub fn lose_frames(&self, count: u32) {
        self.segment().lost = count;
    }
    /// make sending frames fail
    pub fn set_transport_down(&self, down: bool) {
        self.segment().down = down;
    }

    /// current AL state of a slave
    pub fn al_state(&self, position: u16) -> Option<AlState> {
        let segment = self.segment();
        let device = segment.devices.get(usize::from(position))?;
        AlState::try_from(u4::new(device.state())).ok()
    }
    /// AL status code of a slave, if its error flag is set
    pub fn al_error(&self, position: u16) -> Option<u16> {
        let segment = self.segment();
        let device = segment.devices.get(usize::from(position))?;
        if device.memory[registers::al::status.byte] & 0x10 == 0
            {return None}
        registers::al::error.get(&device.memory).ok()
    }
    /// station address set by the master
    pub fn station(&self, position: u16) -> Option<u16> {
        self.segment().devices.get(usize::from(position)).map(|device| device.station())
    }
    /// content of the outputs buffer of a slave
    pub fn outputs(&self, position: u16) -> Vec<u8> {
        let segment = self.segment();
        segment.devices.get(usize::from(position))
            .map(|device| {
                let start = usize::from(SIMULATED_OUTPUTS);
                device.memory[start .. start + usize::from(device.model.outputs)].to_vec()
            })
            .unwrap_or_default()
    }
    /// set the content of the inputs buffer of a slave
    pub fn set_inputs(&self, position: u16, inputs: &[u8]) {
        if let Some(device) = self.segment().devices.get_mut(usize::from(position)) {
            let start = usize::from(SIMULATED_INPUTS);
            let len = inputs.len().min(usize::from(device.model.inputs));
            device.memory[start .. start + len].copy_from_slice(&inputs[.. len]);
        }
    }
    /// EEPROM word addresses read by the master on a slave, since the last call
    pub fn take_sii_reads(&self, position: u16) -> Vec<u16> {
        self.segment().devices.get_mut(usize::from(position))
            .map(|device| core::mem::take(&mut device.sii_reads))
            .unwrap_or_default()
    }
}
impl Default for SimulatedBus {
    fn default() -> Self  {Self::new()}
}

/// socket exchanging frames with a [SimulatedBus]
pub struct SimulatedSocket {
    bus: SimulatedBus,
}

impl EthercatSocket for SimulatedSocket {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut segment = self.bus.segment();
        if segment.down {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "simulated link is down"));
        }
        if segment.lost > 0 {
            segment.lost -= 1;
            return Ok(());
        }
        let mut frame = data.to_vec();
        if segment.process(&mut frame) {
            segment.pending.push_back(frame);
        }
        else {
            warn!("simulated segment dropped a malformed frame");
        }
        Ok(())
    }
    fn receive(&self, data: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let frame = self.bus.segment().pending.pop_front();
        match frame {
            Some(frame) => {
                let size = frame.len().min(data.len());
                data[.. size].copy_from_slice(&frame[.. size]);
                Ok(Some(size))
            },
            None => {
                std::thread::sleep(timeout);
                Ok(None)
            },
        }
    }
    fn max_frame(&self) -> usize  {MAX_ETHERCAT_FRAME}
}
