/*!
    Registers of the slave controller memory used by the master, as [Field]s to read or write with datagrams.

    Some fields overlap: a whole configuration area can be cleared through one field while its entries are written through others.
*/

use bilge::prelude::*;
use crate::data::{self, Field};

pub mod address {
    use super::*;

    /// station address, given by the master for fixed addressing, ETG.1000.4 table 32
    pub const fixed: Field<u16> = Field::simple(0x0010);
    /// station alias, loaded from the EEPROM at power up
    pub const alias: Field<u16> = Field::simple(0x0012);
}
pub mod dl {
    use super::*;

    pub const information: Field<DLInformation> = Field::simple(0x0000);
}

/// sync managers guard the buffers of the mailbox and of the process data in the slave memory
pub mod sync_manager {
    use super::*;

	pub const interface: SyncManager = SyncManager {address: 0x0800, num: 16};
	/// the whole sync manager configuration area, used to clear it
	pub const all: Field<[u8; 128]> = Field::simple(0x0800);
}

/// access to the slave EEPROM, through the slave information interface (SII)
pub mod sii {
    use super::*;

	pub const access: Field<SiiAccess> = Field::simple(0x0500);
	pub const control: Field<SiiControl> = Field::simple(0x0502);
	/// word address of the next EEPROM operation
	pub const address: Field<u16> = Field::simple(0x0504);
	/// data read by the last EEPROM operation
	pub const data: Field<[u8; 8]> = Field::simple(0x0508);

	/// [const@control] and [const@address] written in one datagram
	pub const control_address: Field<SiiControlAddress> = Field::simple(control.byte);
}

/// FMMUs copy parts of the slave physical memory from and to the logical memory
pub mod fmmu {
    use super::*;

    pub const interface: FMMU = FMMU {address: 0x0600, num: 16};
    /// the whole FMMU configuration area, used to clear it
    pub const all: Field<[u8; 256]> = Field::simple(0x0600);
}

/// watchdog registers, ETG.1000.4 table 45
pub mod watchdog {
    use super::*;

    /// process data watchdog time, in units of the watchdog divider (100us by default)
    pub const sync_manager: Field<u16> = Field::simple(0x0420);
}

/// distributed clock registers
pub mod dc {
    use super::*;

    /// local copy of the system time, written on the reference slave to drag its drift
    pub const system_time: Field<u64> = Field::simple(0x0910);
}

/// AL (Application Layer) registers are controling the communication state of a slave
pub mod al {
    use super::*;

    pub const control: Field<AlControlRequest> = Field::simple(0x0120);
    pub const status: Field<AlStatus> = Field::simple(0x0130);
    /// AL status code, see [AlError]
    pub const error: Field<u16> = Field::simple(0x0134);
}



/// ETG.1000.6 table 9
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct AlControlRequest {
    /// requested state of communication
    pub state: AlMixedState,
    /// if true, parameter change of the [AlStatus::error] will be reset
    pub ack: bool,
    /// request of id instead of error code in [al::error]
    pub request_id: bool,
    reserved: u2,
}
data::bilge_pdudata!(AlControlRequest, u8);

impl AlControlRequest {
    /// request a state, acknowledging any error pending on the slave
    pub fn switch(target: AlState) -> Self {
        let mut request = Self::default();
        request.set_state(target.into());
        request.set_ack(true);
        request
    }
}

/// ETG.1000.6 table 12
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct AlStatus {
    /// current state of communication
    pub state: AlMixedState,
    /// true if the last state transition failed, the code is then in [al::error]
    pub error: bool,
    /// if true, ID value is present in [al::error]
    pub id: bool,
    reserved: u2,
}
data::bilge_pdudata!(AlStatus, u8);

/**
    application layer state of one slave

    a slave goes up one state at a time, and can be sent down to any lower state. ETG.1000.6 table 9
*/
#[bitsize(4)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum AlState {
    /// Transitional state meaning the slave is booting up, it cannot be requested by this master.
    Bootstrap = 3,
    /// The init mode allows to set communication registers, like the slave address, the mailbox setup, etc.
    Init = 1,
    /// mailbox communication is enabled, but not process data
    PreOperational = 2,
    /// process data inputs are exchanged, outputs are ignored by the slave
    SafeOperational = 4,
    /// realtime operations running, the slave expects the master to regularly refresh its outputs
    Operational = 8,
}

/**
    states of the slaves answering a broadcast read, OR-ed together

    a single slave reports exactly one of these bits, see [AlState]
*/
#[bitsize(4)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct AlMixedState {
    /// one slave at least is in [AlState::Init]
	pub init: bool,
	/// one slave at least is in [AlState::PreOperational]
	pub pre_operational: bool,
	/// one slave at least is in [AlState::SafeOperational]
	pub safe_operational: bool,
	/// one slave at least is in [AlState::Operational]
	pub operational: bool,
}

impl TryFrom<AlMixedState> for AlState {
    type Error = &'static str;
    fn try_from(state: AlMixedState) -> Result<Self, Self::Error> {
        Self::try_from(u4::from(state)).map_err(|_|  "cannot unwrap when not only 1 state in mix")
    }
}
impl From<AlState> for AlMixedState {
    fn from(state: AlState) -> Self {
        Self::from(u4::from(state))
    }
}

/**
    AL status code reported by a slave refusing a state transition

    ETG.1000.6 table 11
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AlError {
    NoError,
    Unspecified,
    NoMemory,
    InvalidDeviceSetup,
    /// Invalid requested state change
    InvalidStateRequest,
    UnknownStateRequest,
    BootstrapNotSupported,
    NoValidFirmware,
    InvalidMailboxConfigBoot,
    /// Invalid mailbox configuration for switching to [AlState::PreOperational]
    InvalidMailboxConfigPreop,
    InvalidSyncConfig,
    NoInputsAvailable,
    NoValidInputs,
    Synchronization,
    /// Sync manager watchdog expired on the slave side
    SyncWatchdog,
    InvalidSyncTypes,
    InvalidOutputConfig,
    InvalidInputConfig,
    InvalidWatchdogConfig,
    NeedColdStart,
    DeviceIdentificationUpdated,
    ApplicationAvailable,
    /// reserved or vendor specific code
    Specific(u16),
}
impl From<u16> for AlError {
    fn from(code: u16) -> Self {
        match code {
            0x0000 => Self::NoError,
            0x0001 => Self::Unspecified,
            0x0002 => Self::NoMemory,
            0x0003 => Self::InvalidDeviceSetup,
            0x0011 => Self::InvalidStateRequest,
            0x0012 => Self::UnknownStateRequest,
            0x0013 => Self::BootstrapNotSupported,
            0x0014 => Self::NoValidFirmware,
            0x0015 => Self::InvalidMailboxConfigBoot,
            0x0016 => Self::InvalidMailboxConfigPreop,
            0x0017 => Self::InvalidSyncConfig,
            0x0018 => Self::NoInputsAvailable,
            0x0019 => Self::NoValidInputs,
            0x001A => Self::Synchronization,
            0x001B => Self::SyncWatchdog,
            0x001C => Self::InvalidSyncTypes,
            0x001D => Self::InvalidOutputConfig,
            0x001E => Self::InvalidInputConfig,
            0x001F => Self::InvalidWatchdogConfig,
            0x0020 => Self::NeedColdStart,
            0x0061 => Self::DeviceIdentificationUpdated,
            0x00F0 => Self::ApplicationAvailable,
            other => Self::Specific(other),
        }
    }
}
impl From<AlError> for u16 {
    fn from(error: AlError) -> u16 {
        match error {
            AlError::NoError => 0x0000,
            AlError::Unspecified => 0x0001,
            AlError::NoMemory => 0x0002,
            AlError::InvalidDeviceSetup => 0x0003,
            AlError::InvalidStateRequest => 0x0011,
            AlError::UnknownStateRequest => 0x0012,
            AlError::BootstrapNotSupported => 0x0013,
            AlError::NoValidFirmware => 0x0014,
            AlError::InvalidMailboxConfigBoot => 0x0015,
            AlError::InvalidMailboxConfigPreop => 0x0016,
            AlError::InvalidSyncConfig => 0x0017,
            AlError::NoInputsAvailable => 0x0018,
            AlError::NoValidInputs => 0x0019,
            AlError::Synchronization => 0x001A,
            AlError::SyncWatchdog => 0x001B,
            AlError::InvalidSyncTypes => 0x001C,
            AlError::InvalidOutputConfig => 0x001D,
            AlError::InvalidInputConfig => 0x001E,
            AlError::InvalidWatchdogConfig => 0x001F,
            AlError::NeedColdStart => 0x0020,
            AlError::DeviceIdentificationUpdated => 0x0061,
            AlError::ApplicationAvailable => 0x00F0,
            AlError::Specific(code) => code,
        }
    }
}


/// features of the slave controller, ETG.1000.4 table 31
#[bitsize(80)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub struct DLInformation {
    pub ty: u8,
    pub revision: u8,
    pub build: u16,

    pub fmmus: u8,
    pub sync_managers: u8,

    /// process RAM, in KiB
    pub ram_size: u8,
    /// port descriptors, 2 bits per port
    pub ports: u8,

    pub fmmu_bit_operation_not_supported: bool,
    pub reserved_registers_not_supported: bool,
    pub dc_supported: bool,
    /// 64 bit system time if set
    pub dc_range: bool,
    pub ebus_low_jitter: bool,
    pub ebus_enhanced_link_detection: bool,
    pub mii_enhanced_link_detection: bool,
    pub separate_fcs_errors: bool,
    pub dc_sync_activation_enhanced: bool,

    /// `LRD` and `LWR` must be used instead of `LRW`
    pub logical_exchange_not_supported: bool,
    /// read-write physical commands are not available
    pub physicial_exchange_not_supported: bool,
    pub special_fmmu_config: bool,
    reserved: u4,
}
data::bilge_pdudata!(DLInformation, u80);


/// owner of the EEPROM interface, ETG.1000.4 table 48
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub struct SiiAccess {
	pub owner: SiiOwner,
	pub lock: bool,
	reserved: u6,
	/// the slave application is using the interface
	pub pdi: bool,
	reserved: u7,
}
data::bilge_pdudata!(SiiAccess, u16);

#[bitsize(1)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum SiiOwner {
	#[default]
	EthercatDL = 0,
	Pdi = 1,
}

/// EEPROM operation control and status, ETG.1000.4 table 49
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub struct SiiControl {
	pub write_access: bool,
	reserved: u4,
	pub eeprom_emulation: bool,
	/// bytes returned by a read operation, set by the slave
	pub read_size: SiiTransaction,
	/// set by the slave
	pub address_unit: SiiUnit,

	/// written to start a read, stays set until the data is available
	pub read_operation: bool,
	pub write_operation: bool,
	pub reload_operation: bool,

	pub checksum_error: bool,
	pub device_info_error: bool,
	/// the last operation was refused
	pub command_error: bool,
	pub write_error: bool,

	pub busy: bool,
}
data::bilge_pdudata!(SiiControl, u16);

#[bitsize(1)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum SiiTransaction {
	#[default]
	Bytes4 = 0,
	Bytes8 = 1,
}
#[bitsize(1)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum SiiUnit {
	#[default]
	Byte = 0,
	Word = 1,
}

#[repr(packed)]
#[derive(Debug, Copy, Clone)]
pub struct SiiControlAddress {
    pub control: SiiControl,
    pub address: u16,
}
data::packed_pdudata!(SiiControlAddress);

/// location of the FMMU entries, ETG.1000.4 table 57
pub struct FMMU {
    /// address of the first entry
	pub address: u16,
	/// number of entries
	pub num: u8,
}

impl FMMU {
    /// entry register of the given index, wrapped to the number of entries
    pub const fn entry(&self, index: u8) -> Field<FmmuEntry>  {
        Field::simple((self.address as usize) + ((index % self.num) as usize)*0x10)
    }
}

/// mapping of a logical memory range to a physical memory range, ETG.1000.4 table 56
#[bitsize(128)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub struct FmmuEntry {
	pub logical_start_byte: u32,
	pub logical_len_byte: u16,
	pub logical_start_bit: u3,
	reserved: u5,
	pub logical_end_bit: u3,
	reserved: u5,

	pub physical_start_byte: u16,
	pub physical_start_bit: u3,
	reserved: u5,

	/// physical memory is copied to logical read commands
	pub read: bool,
	/// logical write commands are copied to physical memory
	pub write: bool,
	reserved: u6,

	pub enable: bool,
	reserved: u7,
	reserved: u24,
}
data::bilge_pdudata!(FmmuEntry, u128);

impl FmmuEntry {
    /// byte-aligned mapping of a physical range to a logical range
    pub fn bytes(logical: u32, len: u16, physical: u16, direction: SyncDirection) -> Self {
        let mut entry = Self::default();
        entry.set_logical_start_byte(logical);
        entry.set_logical_len_byte(len);
        entry.set_logical_end_bit(u3::new(7));
        entry.set_physical_start_byte(physical);
        match direction {
            SyncDirection::Read => entry.set_read(true),
            SyncDirection::Write => entry.set_write(true),
        }
        entry.set_enable(true);
        entry
    }
}

/// location of the sync manager channels, ETG.1000.4 table 59
pub struct SyncManager {
    /// address of the first channel
    pub address: u16,
    pub num: u8,
}

impl SyncManager {
    /// channel register of the given index, wrapped to the number of channels
    pub const fn channel(&self, index: u8) -> Field<SyncManagerChannel> {
        Field::simple((self.address as usize) + ((index % self.num) as usize) * 8)
    }
    /// channel receiving the master requests
    pub const fn mailbox_write(&self) -> Field<SyncManagerChannel>  {self.channel(0)}
    /// channel holding the slave answers
    pub const fn mailbox_read(&self) -> Field<SyncManagerChannel>  {self.channel(1)}
}

/**
    one sync manager channel, guarding a buffer of the slave memory

    in handshake mode (mailbox) the buffer alternates between writer and reader, in buffered mode the reader always gets the last complete write.
    ETG.1000.4 table 58
*/
#[bitsize(64)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub struct SyncManagerChannel {
    pub address: u16,
    pub length: u16,
    /// 0 for buffered exchange through the logical memory, 2 for mailbox handshake
    pub mode: u2,
    /// see [SyncDirection]
    pub direction: u2,
    pub ec_event: bool,
    pub dls_user_event: bool,
    /// the process data watchdog monitors writes in this buffer
    pub watchdog: bool,
    reserved: u1,

    pub write_event: bool,
    pub read_event: bool,
    reserved: u1,
    /// a mailbox message waits to be read
    pub mailbox_full: bool,
    pub buffer_state: u2,
    pub read_buffer_open: bool,
    pub write_buffer_open: bool,

    pub enable: bool,
    pub repeat: bool,
    reserved: u4,
    pub dc_event_bus: bool,
    pub dc_event_local: bool,

    pub disable_pdi: bool,
    pub repeat_ack: bool,
    reserved: u6,
}
data::bilge_pdudata!(SyncManagerChannel, u64);

impl SyncManagerChannel {
    /**
        enabled channel from its start address, length, and control byte (as given by the SII)

        the control byte gathers [Self::mode], [Self::direction] and event flags
    */
    pub fn enabled(address: u16, length: u16, control: u8) -> Self {
        let mut channel = Self::from(
            u64::from(address)
            | u64::from(length) << 16
            | u64::from(control) << 32
            );
        channel.set_enable(true);
        channel
    }
}

/// ETG.1000.4 table 58
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyncDirection {
    /// sync manager buffer is read by the master
    Read = 0,
    /// sync manager buffer is written by the master
    Write = 1,
}
