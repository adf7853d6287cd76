/*!
    Settings of the master, gathered in [MasterConfig].

    Every timing, retry budget and threshold used by the master is a field here, the defaults are values working on common hardware.
*/

use std::path::PathBuf;
use core::time::Duration;
use crate::sii::Identity;


/// all the settings of a [crate::Master]
#[derive(Clone, Debug, Default)]
pub struct MasterConfig {
    pub transport: TransportConfig,
    pub scan: ScanConfig,
    pub slave: SlaveConfig,
    pub cyclic: CyclicConfig,
    /// slaves needed for the master to be operational
    pub required: RequiredSlaves,
    /**
        identities expected at each position, checked after each scan

        slaves at positions beyond this list are not checked
    */
    pub expected: Vec<ExpectedSlave>,
    pub logical: LogicalConfig,
}

/// settings of [crate::RawMaster] and its transport driver
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// delay to wait for more datagrams before sending a frame
    pub merge_time: Duration,
    /// default deadline of a datagram transmission
    pub response_timeout: Duration,
    /// maximum time the driver waits for a frame to come back
    pub receive_timeout: Duration,
    /// default number of retransmissions of a datagram
    pub retries: u8,
    /// consecutive transport failures after which the link is considered down
    pub link_down_after: u32,
    /// run the transport driver with realtime priority
    pub realtime: bool,
}
impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            merge_time: Duration::from_micros(100),
            response_timeout: Duration::from_millis(10),
            receive_timeout: Duration::from_millis(10),
            retries: 3,
            link_down_after: 5,
            realtime: false,
        }
    }
}

/// settings of [crate::scanner]
#[derive(Clone, Debug)]
pub struct ScanConfig {
    /// station address given to the slave at position 0, the following slaves get the following addresses
    pub station_base: u16,
    /// number of retries of the identity probe of a position
    pub probe_retries: u8,
    /// positions are never probed beyond this limit
    pub max_positions: u16,
    /// number of slaves expected on the bus, so positions not answering are reported as gaps
    pub expected_slaves: u16,
    /// read the alias from the station alias register instead of the EEPROM
    pub alias_from_register: bool,
}
impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            station_base: 0x1000,
            probe_retries: 2,
            max_positions: 512,
            expected_slaves: 0,
            alias_from_register: false,
        }
    }
}

/// settings of [crate::Slave] state transitions
#[derive(Clone, Debug)]
pub struct SlaveConfig {
    /// maximum time for a slave to reach a requested state
    pub transition_timeout: Duration,
    /// maximum time for an EEPROM read operation
    pub sii_timeout: Duration,
    /// retries of a failed configuration step before the slave is stalled
    pub config_retries: u8,
    /// reuse EEPROM content read in previous scans
    pub sii_cache: bool,
    /// give EEPROM access back to the slave application after reading it
    pub sii_assign_pdi: bool,
    /// go back to operational without reconfiguration after a process data watchdog expiry
    pub quick_op: bool,
    /**
        sync manager watchdog programmed on the process data channels

        `None` keeps the slave default
    */
    pub sync_watchdog: Option<u16>,
    /// directory of EEPROM images used instead of reading the slaves, see [crate::DirectoryOverride]
    pub sii_directory: Option<PathBuf>,
}
impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            transition_timeout: Duration::from_secs(5),
            sii_timeout: Duration::from_millis(100),
            config_retries: 3,
            sii_cache: true,
            sii_assign_pdi: true,
            quick_op: true,
            sync_watchdog: None,
            sii_directory: None,
        }
    }
}

/// settings of [crate::cyclic::CyclicEngine]
#[derive(Clone, Debug)]
pub struct CyclicConfig {
    /// period of process data exchanges
    pub period: Duration,
    /**
        deadline of the process data exchange in a cycle

        `None` derives it from the measured frame round trip, bounded by the period
    */
    pub deadline: Option<Duration>,
    /// consecutive missed exchanges after which a slave drops out of operational
    pub watchdog_threshold: u32,
    /// maximum time for a mailbox request to get its answer
    pub mailbox_timeout: Duration,
}
impl Default for CyclicConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(1),
            deadline: None,
            watchdog_threshold: 3,
            mailbox_timeout: Duration::from_secs(1),
        }
    }
}

/// placement of the process data image in the logical memory
#[derive(Clone, Debug)]
pub struct LogicalConfig {
    pub base: u32,
    pub size: u32,
}
impl Default for LogicalConfig {
    fn default() -> Self {
        Self {base: 0x1_0000, size: 0x1_0000}
    }
}

/// slaves that must be operational for the master to be operational
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RequiredSlaves {
    /// every slave on the bus, and no gap in the chain
    All,
    /// this number of slaves at least, others are allowed to fail
    AtLeast(usize),
}
impl Default for RequiredSlaves {
    fn default() -> Self  {Self::All}
}

/// identity a slave must match, `None` fields match anything
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ExpectedSlave {
    pub vendor: Option<u32>,
    pub product: Option<u32>,
    pub revision: Option<u32>,
    pub serial: Option<u32>,
}
impl ExpectedSlave {
    /// expect a given device model, any revision or serial
    pub fn model(vendor: u32, product: u32) -> Self {
        Self {vendor: Some(vendor), product: Some(product), ..Default::default()}
    }
    /// match anything
    pub fn any() -> Self  {Self::default()}
    pub fn matches(&self, identity: &Identity) -> bool {
        self.vendor.map_or(true, |v| v == identity.vendor)
        && self.product.map_or(true, |v| v == identity.product)
        && self.revision.map_or(true, |v| v == identity.revision)
        && self.serial.map_or(true, |v| v == identity.serial)
    }
}
