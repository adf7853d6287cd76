/*!
    wire format of ethercat frames: the frame header, and the datagrams (PDU) it carries.

    ETG.1000.4 5.3
*/

use bilge::prelude::*;
use crate::data;


/// maximum frame size, currently limited to the size tolerated by its header (content size coded with 11 bits)
pub const MAX_ETHERCAT_FRAME: usize = 2 + 0x7ff;
/// bytes added by a datagram around its payload: header and working counter
pub const PDU_OVERHEAD: usize = 10 + 2;
/// frame type of frames carrying datagrams
pub const ETHERCAT_TYPE_PDU: u8 = 0x1;


/// ethercat frame header (common to ethernet or UDP mediums) as described in ETG 1000.4 table 11
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub struct EthercatHeader {
    /// length of the ethercat frame (minus 2 bytes, which is the header)
    pub len: u11,
    reserved: u1,
    /// frame type, only [ETHERCAT_TYPE_PDU] is used by this master
    pub ty: u4,
}
data::bilge_pdudata!(EthercatHeader, u16);

impl EthercatHeader {
    pub fn pdu(len: u16) -> Self {
        let mut header = Self::default();
        header.set_len(u11::new(len));
        header.set_ty(u4::new(ETHERCAT_TYPE_PDU));
        header
    }
}

/// header of a PDU frame, this one of the possible ethercat frames
#[bitsize(80)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub struct PduHeader {
    /// PDU command, specifying whether logical or physical memory is accesses, addressing type, and what read/write operation
    pub command: u8,
    /// PDU task request identifier
    pub token: u8,
    /**
        destination of the PDU, its meaning depend on the command

        - for physical commands, the 16 low bits are the slave address and the 16 high bits the register
        - for logical commands, it is the 32 bit logical address
    */
    pub address: u32,
    /// data length following the header, excluding the footer.
    pub len: u11,
    reserved: u3,
    pub circulating: bool,
    /// true if there is an other PDU in the same PDU frame
    pub next: bool,
    pub interrupt: u16,
}
data::bilge_pdudata!(PduHeader, u80);

impl PduHeader {
    pub fn request(command: PduCommand, token: u8, address: u32, len: u16, next: bool) -> Self {
        let mut header = Self::default();
        header.set_command(u8::from(command));
        header.set_token(token);
        header.set_address(address);
        header.set_len(u11::new(len));
        header.set_next(next);
        header
    }
}

/// the possible PDU commands
#[bitsize(8)]
#[derive(FromBits, Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum PduCommand {
    /// no operation
    #[fallback]
    #[default]
    NOP = 0x0,

    /// broadcast read
    BRD = 0x07,
    /// broadcast write
    BWR = 0x08,
    /// broadcast read & write
    BRW = 0x09,

    /// auto-incremented slave read
    APRD = 0x01,
    /// auto-incremented slave write
    APWR = 0x02,
    /// auto-incremented slave read & write
    APRW = 0x03,

    /// fixed slave read
    FPRD = 0x04,
    /// fixed slave write
    FPWR = 0x05,
    /// fixed slave read & write
    FPRW = 0x06,

    /// logical memory read
    LRD = 0x0A,
    /// logical memory write
    LWR = 0x0B,
    /// logical memory read & write
    LRW = 0x0C,

    /// auto-incremented slave read multiple write
    ARMW = 0x0D,
    /// fixed slave read multiple write
    FRMW = 0x0E,
}

impl PduCommand {
    /**
        true if the slave part of the address is incremented by every slave the datagram passes through

        The answer to such a datagram comes back with a different slave address than the one sent.
    */
    pub fn position_addressed(&self) -> bool {
        matches!(self,
            Self::APRD | Self::APWR | Self::APRW | Self::ARMW
            | Self::BRD | Self::BWR | Self::BRW)
    }
    /// true if the command addresses the logical memory
    pub fn logical(&self) -> bool {
        matches!(self, Self::LRD | Self::LWR | Self::LRW)
    }
}

/// dynamically specifies a destination address on the ethercat loop
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SlaveAddress {
	/// every slave will receive and execute
	Broadcast,
	/// address will be determined by the topology (index of the slave in the ethernet loop)
	AutoIncremented(u16),
	/// address has been set by the master previously
	Fixed(u16),
	/// the logical memory is the destination, all slaves are concerned
	Logical,
}

impl SlaveAddress {
    /// 32 bit datagram address of a register (or logical offset) for this slave
    pub fn datagram(&self, memory: u32) -> u32 {
        let slave = match *self {
            SlaveAddress::Broadcast => 0,
            SlaveAddress::AutoIncremented(position) => 0u16.wrapping_sub(position),
            SlaveAddress::Fixed(address) => address,
            SlaveAddress::Logical => return memory,
        };
        u32::from(slave) | memory << 16
    }
    /// read command for this kind of address
    pub fn read(&self) -> PduCommand {
        match self {
            SlaveAddress::Broadcast => PduCommand::BRD,
            SlaveAddress::AutoIncremented(_) => PduCommand::APRD,
            SlaveAddress::Fixed(_) => PduCommand::FPRD,
            SlaveAddress::Logical => PduCommand::LRD,
        }
    }
    /// write command for this kind of address
    pub fn write(&self) -> PduCommand {
        match self {
            SlaveAddress::Broadcast => PduCommand::BWR,
            SlaveAddress::AutoIncremented(_) => PduCommand::APWR,
            SlaveAddress::Fixed(_) => PduCommand::FPWR,
            SlaveAddress::Logical => PduCommand::LWR,
        }
    }
    /// read & write command for this kind of address
    pub fn exchange(&self) -> PduCommand {
        match self {
            SlaveAddress::Broadcast => PduCommand::BRW,
            SlaveAddress::AutoIncremented(_) => PduCommand::APRW,
            SlaveAddress::Fixed(_) => PduCommand::FPRW,
            SlaveAddress::Logical => PduCommand::LRW,
        }
    }
}
