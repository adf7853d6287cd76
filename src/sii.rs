/*!
    Slave Information Interface (SII): access to the slave's EEPROM, and the parsed content of this EEPROM.

    ETG.1000.4 6.4, ETG.1000.6 5.4
*/

use std::time::Instant;
use core::{fmt, time::Duration};
use log::*;

use crate::{
    data::{PduData, Cursor},
    error::{EthercatError, EthercatResult},
    rawmaster::RawMaster,
    registers::{self, SiiControl, SiiControlAddress, SiiAccess, SiiOwner, SiiTransaction},
    eeprom::{self, WORD, CategoryHeader, CategoryType, FmmuUsage, SyncManagerEntry, SyncManagerUsage,
            PdoHeader, PdoEntry, MailboxTypes},
    };


/// EEPROM images bigger than this are considered corrupted
const MAX_IMAGE: usize = 0x1_0000;


/// signature of a device, read from its EEPROM
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Identity {
    pub vendor: u32,
    pub product: u32,
    pub revision: u32,
    pub serial: u32,
}
impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}:{:#010x} rev {:#x} serial {}", self.vendor, self.product, self.revision, self.serial)
    }
}

/// error reported by the EEPROM of a slave
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SiiError {
    /// the slave refused the EEPROM command
    Command,
    /// the EEPROM content does not follow the standard layout
    Malformed(&'static str),
}

impl From<EthercatError<()>> for EthercatError<SiiError> {
    fn from(src: EthercatError<()>) -> Self  {src.upgrade()}
}


/// implementation of the Slave Information Interface (SII) to communicate with a slave's EEPROM memory
pub struct Sii<'a> {
    master: &'a RawMaster,
    /// fixed address of the slave
    slave: u16,
    timeout: Duration,
    assign_pdi: bool,
}
impl<'a> Sii<'a> {
    /**
        `timeout` bounds each EEPROM operation,
        `assign_pdi` gives the EEPROM back to the slave application on [Self::release]
    */
    pub fn new(master: &'a RawMaster, slave: u16, timeout: Duration, assign_pdi: bool) -> Self {
        Self {master, slave, timeout, assign_pdi}
    }

    /// take the EEPROM access for the master
    pub async fn acquire(&self) -> EthercatResult<(), SiiError> {
        self.assign(SiiOwner::EthercatDL).await
    }
    /// give the EEPROM access to the slave application if configured so
    pub async fn release(&self) -> EthercatResult<(), SiiError> {
        if self.assign_pdi
            {self.assign(SiiOwner::Pdi).await}
        else
            {Ok(())}
    }
    async fn assign(&self, owner: SiiOwner) -> EthercatResult<(), SiiError> {
        let mut access = SiiAccess::default();
        access.set_owner(owner);
        self.master.fpwr(self.slave, registers::sii::access, access).await?.one()?;
        Ok(())
    }

    /// wait for the EEPROM to finish its current operation
    async fn idle(&self) -> EthercatResult<SiiControl, SiiError> {
        let start = Instant::now();
        loop {
            let control = self.master.fprd(self.slave, registers::sii::control).await?.one()?;
            if ! control.busy() && ! control.read_operation()
                {return Ok(control)}
            if start.elapsed() > self.timeout
                {return Err(EthercatError::Timeout("eeprom busy"))}
        }
    }

    /// read EEPROM content from the given word address
    pub async fn read(&self, word: u16, buffer: &mut [u8]) -> EthercatResult<(), SiiError> {
        let mut address = word;
        let mut cursor = Cursor::new(buffer);
        while ! cursor.remain().is_empty() {
            self.idle().await?;
            let mut control = SiiControl::default();
            control.set_read_operation(true);
            self.master.fpwr(self.slave, registers::sii::control_address, SiiControlAddress {
                control,
                address,
                }).await?.one()?;

            let control = self.idle().await?;
            if control.command_error()
                {return Err(EthercatError::Slave(SiiError::Command))}
            let chunk = match control.read_size() {
                SiiTransaction::Bytes4 => 4,
                SiiTransaction::Bytes8 => 8,
            };
            let data = self.master.fprd(self.slave, registers::sii::data).await?.one()?;
            let size = chunk.min(cursor.remain().len());
            cursor.write(&data[.. size])?;
            address = address.wrapping_add((chunk / WORD) as u16);
        }
        Ok(())
    }

    /// cheap read of the alias and identity words
    pub async fn read_identity(&self) -> EthercatResult<(u16, Identity), SiiError> {
        let start = usize::from(eeprom::IDENTITY_WORDS.start) * WORD;
        let mut header = [0; eeprom::IDENTITY_WORDS.end as usize * WORD];
        self.read(eeprom::IDENTITY_WORDS.start, &mut header[start ..]).await?;
        parse_identity(&header)
            .map_err(EthercatError::Slave)
    }

    /// read the whole EEPROM content: the header and all categories until the end marker
    pub async fn read_image(&self) -> EthercatResult<Vec<u8>, SiiError> {
        let mut image = vec![0; eeprom::HEADER_SIZE];
        self.read(0, &mut image).await?;

        let mut word = eeprom::CATEGORIES;
        loop {
            let mut header = [0; 4];
            self.read(word, &mut header).await?;
            image.extend_from_slice(&header);
            let header = CategoryHeader::unpack(&header)?;
            if header.category() == Some(CategoryType::End)
                {break}

            let size = usize::from(header.size()) * WORD;
            if image.len() + size > MAX_IMAGE
                {return Err(EthercatError::Slave(SiiError::Malformed("eeprom image too big")))}
            let start = image.len();
            image.resize(start + size, 0);
            self.read(word + 2, &mut image[start ..]).await?;
            word = word.wrapping_add(2 + header.size());
        }
        debug!("slave {:#x} eeprom read, {} bytes", self.slave, image.len());
        Ok(image)
    }
}

fn parse_identity(header: &[u8]) -> Result<(u16, Identity), SiiError> {
    let malformed = |_| SiiError::Malformed("eeprom header too short");
    Ok((
        eeprom::address_alias.get(header).map_err(malformed)?,
        Identity {
            vendor: eeprom::device::vendor.get(header).map_err(malformed)?,
            product: eeprom::device::product.get(header).map_err(malformed)?,
            revision: eeprom::device::revision.get(header).map_err(malformed)?,
            serial: eeprom::device::serial_number.get(header).map_err(malformed)?,
        },
    ))
}



/// location of a sync manager channel in the slave physical memory
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SyncLayout {
    /// index of the sync manager channel
    pub index: u8,
    pub address: u16,
    pub length: u16,
    /// control byte, see [registers::SyncManagerChannel::enabled]
    pub control: u8,
}

/// sync managers used for mailbox
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MailboxLayout {
    /// master to slave
    pub write: SyncLayout,
    /// slave to master
    pub read: SyncLayout,
}

/// sync managers used for process data
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ProcessLayout {
    /// master to slave
    pub outputs: Option<SyncLayout>,
    /// slave to master
    pub inputs: Option<SyncLayout>,
}
impl ProcessLayout {
    pub fn outputs_size(&self) -> u16  {self.outputs.map_or(0, |sync| sync.length)}
    pub fn inputs_size(&self) -> u16  {self.inputs.map_or(0, |sync| sync.length)}
}

/// general informations about the device
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct General {
    pub name: Option<String>,
    /// safe operational is allowed without outputs
    pub safe_op: bool,
    /// LRW shall not be used with this slave
    pub not_lrw: bool,
}

/// a PDO described in the EEPROM
#[derive(Clone, Debug)]
pub struct Pdo {
    pub index: u16,
    pub sync_manager: u8,
    pub entries: Vec<PdoEntry>,
}
impl Pdo {
    pub fn bitsize(&self) -> usize {
        self.entries.iter().map(|entry| usize::from(entry.bitlen)).sum()
    }
}

/**
    content of a slave's EEPROM, parsed

    The raw bytes are kept as read, an image is never modified once read.
*/
#[derive(Clone, Debug)]
pub struct SiiImage {
    raw: Vec<u8>,
    pub alias: u16,
    pub identity: Identity,
    pub mailbox: Option<MailboxLayout>,
    pub protocols: MailboxTypes,
    pub general: General,
    pub strings: Vec<String>,
    pub fmmus: Vec<FmmuUsage>,
    pub sync_managers: Vec<SyncManagerEntry>,
    /// slave to master PDOs
    pub tx_pdos: Vec<Pdo>,
    /// master to slave PDOs
    pub rx_pdos: Vec<Pdo>,
}

impl SiiImage {
    pub fn parse(raw: Vec<u8>) -> Result<Self, SiiError> {
        let (alias, identity) = parse_identity(&raw)?;
        let malformed = |_| SiiError::Malformed("eeprom header too short");
        let protocols = eeprom::mailbox::protocols.get(&raw).map_err(malformed)?;

        let mut image = Self {
            alias,
            identity,
            mailbox: None,
            protocols,
            general: General::default(),
            strings: Vec::new(),
            fmmus: Vec::new(),
            sync_managers: Vec::new(),
            tx_pdos: Vec::new(),
            rx_pdos: Vec::new(),
            raw: Vec::new(),
        };
        let mut name = None;

        let mut cursor = Cursor::new(raw.get(eeprom::HEADER_SIZE ..)
            .ok_or(SiiError::Malformed("eeprom header too short"))?);
        let truncated = |_| SiiError::Malformed("truncated category");
        while cursor.remain().len() >= CategoryHeader::packed_size() {
            let header = cursor.unpack::<CategoryHeader>().map_err(truncated)?;
            if header.category() == Some(CategoryType::End)
                {break}
            let content = cursor.read(usize::from(header.size()) * WORD).map_err(truncated)?;
            match header.category() {
                Some(CategoryType::Strings) => image.strings = parse_strings(content)?,
                Some(CategoryType::General) => {
                    if content.len() < eeprom::general::SIZE
                        {return Err(SiiError::Malformed("general category too short"))}
                    let flags = content[eeprom::general::FLAGS];
                    name = Some(content[eeprom::general::NAME]);
                    image.general.safe_op = flags & eeprom::general::ENABLE_SAFEOP != 0;
                    image.general.not_lrw = flags & eeprom::general::ENABLE_NOT_LRW != 0;
                },
                Some(CategoryType::Fmmu) => image.fmmus = content.iter()
                    .map(|&usage| FmmuUsage::from(usage))
                    .collect(),
                Some(CategoryType::SyncManager) => image.sync_managers = content
                    .chunks_exact(SyncManagerEntry::packed_size())
                    .map(SyncManagerEntry::unpack)
                    .collect::<Result<_,_>>()
                    .map_err(truncated)?,
                Some(CategoryType::TxPdo) => image.tx_pdos.extend(parse_pdos(content)?),
                Some(CategoryType::RxPdo) => image.rx_pdos.extend(parse_pdos(content)?),
                other => trace!("ignoring eeprom category {:?} ({})", other, header.ty()),
            }
        }
        // strings are indexed from 1, 0 means no string
        image.general.name = name
            .and_then(|index| usize::from(index).checked_sub(1))
            .and_then(|index| image.strings.get(index))
            .cloned();
        image.mailbox = image.parse_mailbox(&raw).map_err(malformed)?;
        image.raw = raw;
        Ok(image)
    }

    fn parse_mailbox(&self, raw: &[u8]) -> crate::data::PackingResult<Option<MailboxLayout>> {
        let write = (eeprom::mailbox::receive::offset.get(raw)?, eeprom::mailbox::receive::size.get(raw)?);
        let read = (eeprom::mailbox::send::offset.get(raw)?, eeprom::mailbox::send::size.get(raw)?);
        if write.1 == 0 || read.1 == 0
            {return Ok(None)}
        let control = |index: usize, default: u8| self.sync_managers.get(index)
            .map_or(default, |entry| entry.control);
        Ok(Some(MailboxLayout {
            write: SyncLayout {index: 0, address: write.0, length: write.1, control: control(0, 0x26)},
            read: SyncLayout {index: 1, address: read.0, length: read.1, control: control(1, 0x22)},
        }))
    }

    /// the bytes of the EEPROM, as read
    pub fn raw(&self) -> &[u8]  {&self.raw}

    /**
        sync managers used for process data

        the sizes are deduced from the PDOs assigned to each sync manager, or the sync manager default size when no PDO is described
    */
    pub fn process_layout(&self) -> ProcessLayout {
        let channel = |usage: SyncManagerUsage, pdos: &[Pdo]| {
            let (index, entry) = self.sync_managers.iter()
                .enumerate()
                .find(|(_, entry)| SyncManagerUsage::from(entry.usage) == usage)?;
            let index = u8::try_from(index).ok()?;
            let assigned = pdos.iter().filter(|pdo| pdo.sync_manager == index);
            let bits: usize = assigned.clone().map(Pdo::bitsize).sum();
            let length = if assigned.count() == 0
                {entry.length}
                else {u16::try_from((bits + 7) / 8).ok()?};
            if length == 0 || entry.enable & 1 == 0
                {return None}
            Some(SyncLayout {
                index,
                address: entry.address,
                length,
                control: entry.control,
                })
        };
        ProcessLayout {
            outputs: channel(SyncManagerUsage::ProcessOut, &self.rx_pdos),
            inputs: channel(SyncManagerUsage::ProcessIn, &self.tx_pdos),
        }
    }
}

fn parse_strings(content: &[u8]) -> Result<Vec<String>, SiiError> {
    let truncated = |_| SiiError::Malformed("truncated strings category");
    let mut cursor = Cursor::new(content);
    let count = cursor.unpack::<u8>().map_err(truncated)?;
    (0 .. count)
        .map(|_| {
            let len = cursor.unpack::<u8>().map_err(truncated)?;
            let string = cursor.read(usize::from(len)).map_err(truncated)?;
            Ok(String::from_utf8_lossy(string).into_owned())
        })
        .collect()
}

fn parse_pdos(content: &[u8]) -> Result<Vec<Pdo>, SiiError> {
    let truncated = |_| SiiError::Malformed("truncated pdo category");
    let mut cursor = Cursor::new(content);
    let mut pdos = Vec::new();
    while cursor.remain().len() >= PdoHeader::packed_size() {
        let header = cursor.unpack::<PdoHeader>().map_err(truncated)?;
        let entries = (0 .. header.entries)
            .map(|_| cursor.unpack::<PdoEntry>())
            .collect::<Result<Vec<_>,_>>()
            .map_err(truncated)?;
        pdos.push(Pdo {
            index: header.index,
            sync_manager: header.sync_manager,
            entries,
        });
    }
    Ok(pdos)
}



#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{SimulatedSlave, SIMULATED_MAILBOX_OUT, SIMULATED_OUTPUTS, SIMULATED_INPUTS};

    #[test]
    fn parse_simulated_eeprom() {
        let model = SimulatedSlave::new(0x2, 0x1234)
            .revision(7)
            .serial(42)
            .alias(0x55)
            .process(6, 3);
        let image = SiiImage::parse(model.eeprom()).unwrap();

        assert_eq!(image.alias, 0x55);
        assert_eq!(image.identity, Identity {vendor: 0x2, product: 0x1234, revision: 7, serial: 42});
        assert!(image.protocols.can());
        assert_eq!(image.general.name.as_deref(), Some("simulated slave"));
        assert!(! image.general.not_lrw);
        assert_eq!(image.fmmus[0], FmmuUsage::Outputs);
        assert_eq!(image.sync_managers.len(), 4);
        assert_eq!(image.rx_pdos[0].bitsize(), 6*8);

        let mailbox = image.mailbox.unwrap();
        assert_eq!(mailbox.write.address, SIMULATED_MAILBOX_OUT);
        assert_eq!(mailbox.write.control, 0x26);

        let layout = image.process_layout();
        assert_eq!(layout.outputs.unwrap().address, SIMULATED_OUTPUTS);
        assert_eq!(layout.outputs_size(), 6);
        assert_eq!(layout.inputs.unwrap().address, SIMULATED_INPUTS);
        assert_eq!(layout.inputs_size(), 3);
        assert_eq!(image.raw().len() % 2, 0);
    }

    #[test]
    fn parse_device_without_mailbox() {
        let model = SimulatedSlave::new(0x2, 0x1)
            .without_mailbox()
            .without_logical_exchange()
            .process(0, 2);
        let image = SiiImage::parse(model.eeprom()).unwrap();
        assert!(image.mailbox.is_none());
        assert!(image.general.not_lrw);
        let layout = image.process_layout();
        assert!(layout.outputs.is_none());
        assert_eq!(layout.inputs_size(), 2);
    }

    #[test]
    fn truncated_eeprom() {
        let mut raw = SimulatedSlave::new(0x2, 0x1).eeprom();
        raw.truncate(eeprom::HEADER_SIZE + 10);
        assert!(matches!(SiiImage::parse(raw), Err(SiiError::Malformed(_))));
        assert!(SiiImage::parse(vec![0; 10]).is_err());
    }
}
