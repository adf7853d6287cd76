/*!
    Layout of the slave EEPROM, as read through [crate::sii].

    The fixed header words are given as [Field]s with byte offsets. Categories follow the header, each one starting with a [CategoryHeader], until the [CategoryType::End] marker.

    ETG.1000.6 5.4
*/

use crate::data::{self, Field};
use bilge::prelude::*;


/// size of an EEPROM address unit
pub const WORD: usize = core::mem::size_of::<u16>();


//  ETG.1000.6 5.4 table 16

/// station alias loaded by the slave at power up
pub const address_alias: Field<u16> = Field::simple(WORD*0x0004);
/// CRC-8 of words 0 to 6 in the low byte
pub const checksum: Field<u16> = Field::simple(WORD*0x0007);

pub mod device {
    use super::*;

    pub const vendor: Field<u32> = Field::simple(WORD*0x0008);
    pub const product: Field<u32> = Field::simple(WORD*0x000a);
    pub const revision: Field<u32> = Field::simple(WORD*0x000c);
    pub const serial_number: Field<u32> = Field::simple(WORD*0x000e);
}

/// mailbox recommended parameters, the bootstrap mailbox is not used by this master
pub mod mailbox {
    use super::*;

    /// master to slave
    pub mod receive {
        use super::*;

        pub const offset: Field<u16> = Field::simple(WORD*0x0018);
        pub const size: Field<u16> = Field::simple(WORD*0x0019);
    }
    /// slave to master
    pub mod send {
        use super::*;

        pub const offset: Field<u16> = Field::simple(WORD*0x001a);
        pub const size: Field<u16> = Field::simple(WORD*0x001b);
    }
    pub const protocols: Field<MailboxTypes> = Field::simple(WORD*0x001c);
}

/// EEPROM capacity in KiBit, minus one
pub const eeprom_size: Field<u16> = Field::simple(WORD*0x003e);
pub const version: Field<u16> = Field::simple(WORD*0x003f);

/// word address of the first category
pub const CATEGORIES: u16 = 0x0040;
/// bytes of the header preceding the categories
pub const HEADER_SIZE: usize = WORD * CATEGORIES as usize;
/// words read by the cheap identity probe: alias and identity words
pub const IDENTITY_WORDS: core::ops::Range<u16> = 0x0004 .. 0x0010;



/// mailbox protocols a slave supports, ETG.1000.6 table 18
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct MailboxTypes {
    pub ads: bool,
    pub ethernet: bool,
    /// CANopen services, SDO in particular
    pub can: bool,
    pub file: bool,
    pub servo: bool,
    pub specific: bool,
    reserved: u10,
}
data::bilge_pdudata!(MailboxTypes, u16);

impl MailboxTypes {
    /// true if at least one mailbox protocol is supported
    pub fn any(&self) -> bool  {u16::from(*self) != 0}
}


/// header for a SII category, ETG.1000.6 table 17
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct CategoryHeader {
    /// see [CategoryType], values with the high bit set are vendor specific
    pub ty: u16,
    /// content length in words
    pub size: u16,
}
data::bilge_pdudata!(CategoryHeader, u32);

impl CategoryHeader {
    pub fn category(&self) -> Option<CategoryType>  {CategoryType::from_id(self.ty())}
}

/// type of category in the SII, ETG.1000.6 table 19
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CategoryType {
    Nop = 0,
    /// length prefixed strings referenced by index from the other categories
    Strings = 10,
    DataTypes = 20,
    /// see [general]
    General = 30,
    /// one [FmmuUsage] byte per FMMU
    Fmmu = 40,
    /// sequence of [SyncManagerEntry]
    SyncManager = 41,
    /// inputs, sequence of [PdoHeader] each followed by its [PdoEntry]s
    TxPdo = 50,
    /// outputs
    RxPdo = 51,
    Dc = 60,
    End = 0xffff,
}
impl CategoryType {
    pub fn from_id(id: u16) -> Option<Self> {
        Some(match id {
            0 => Self::Nop,
            10 => Self::Strings,
            20 => Self::DataTypes,
            30 => Self::General,
            40 => Self::Fmmu,
            41 => Self::SyncManager,
            50 => Self::TxPdo,
            51 => Self::RxPdo,
            60 => Self::Dc,
            0xffff => Self::End,
            _ => return None,
        })
    }
}

/// byte offsets in the general category, ETG.1000.6 table 21
pub mod general {
    /// index in the strings category of the device name
    pub const NAME: usize = 3;
    /// flags byte
    pub const FLAGS: usize = 11;
    /// [FLAGS] bit: safe operational state is allowed without outputs
    pub const ENABLE_SAFEOP: u8 = 0b01;
    /// [FLAGS] bit: the slave does not support LRW, the master shall use LRD and LWR
    pub const ENABLE_NOT_LRW: u8 = 0b10;
    /// minimum size of the category
    pub const SIZE: usize = 32;
}

/// usage of an FMMU as written in the FMMU category, ETG.1000.6 table 23
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FmmuUsage {
    Unused,
    Outputs,
    Inputs,
    /// syncmanager status polling
    MailboxState,
}
impl From<u8> for FmmuUsage {
    fn from(byte: u8) -> Self {
        match byte {
            1 => Self::Outputs,
            2 => Self::Inputs,
            3 => Self::MailboxState,
            _ => Self::Unused,
        }
    }
}
impl From<FmmuUsage> for u8 {
    fn from(usage: FmmuUsage) -> u8 {
        match usage {
            FmmuUsage::Unused => 0,
            FmmuUsage::Outputs => 1,
            FmmuUsage::Inputs => 2,
            FmmuUsage::MailboxState => 3,
        }
    }
}

/// sync manager entry in the sync manager category, ETG.1000.6 table 24
#[repr(packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct SyncManagerEntry {
    /// start address in the slave physical memory
    pub address: u16,
    pub length: u16,
    /// initial value of the sync manager control register
    pub control: u8,
    pub status: u8,
    /// bit 0 enables the channel
    pub enable: u8,
    /// see [SyncManagerUsage]
    pub usage: u8,
}
data::packed_pdudata!(SyncManagerEntry);

/// usage of a sync manager, ETG.1000.6 table 24
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyncManagerUsage {
    Unused,
    /// master to slave mailbox
    MailboxOut,
    /// slave to master mailbox
    MailboxIn,
    /// master to slave process data
    ProcessOut,
    /// slave to master process data
    ProcessIn,
}
impl From<u8> for SyncManagerUsage {
    fn from(byte: u8) -> Self {
        match byte {
            1 => Self::MailboxOut,
            2 => Self::MailboxIn,
            3 => Self::ProcessOut,
            4 => Self::ProcessIn,
            _ => Self::Unused,
        }
    }
}
impl From<SyncManagerUsage> for u8 {
    fn from(usage: SyncManagerUsage) -> u8 {
        match usage {
            SyncManagerUsage::Unused => 0,
            SyncManagerUsage::MailboxOut => 1,
            SyncManagerUsage::MailboxIn => 2,
            SyncManagerUsage::ProcessOut => 3,
            SyncManagerUsage::ProcessIn => 4,
        }
    }
}

/// header of a PDO in the RxPdo or TxPdo categories, ETG.1000.6 table 25
#[repr(packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct PdoHeader {
    /// index of the PDO object
    pub index: u16,
    /// number of entries following
    pub entries: u8,
    /// sync manager this PDO is assigned to
    pub sync_manager: u8,
    pub dc: u8,
    /// index of the name in the strings category
    pub name: u8,
    pub flags: u16,
}
data::packed_pdudata!(PdoHeader);

/// entry of a PDO in the RxPdo or TxPdo categories, ETG.1000.6 table 26
#[repr(packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct PdoEntry {
    pub index: u16,
    pub sub: u8,
    /// index of the name in the strings category
    pub name: u8,
    pub dtype: u8,
    pub bitlen: u8,
    pub flags: u16,
}
data::packed_pdudata!(PdoEntry);
