/*!
    Core of an EtherCAT master: slaves state machines and cyclic process data exchange.

    - [RawMaster] batches datagrams from concurrent tasks into frames, and runs the transport driver
    - [scanner] discovers the slaves on the bus and reconciles them with the slaves already known
    - [Slave] drives one slave through its communication states, reading its EEPROM once thanks to [SiiCache]
    - [CyclicEngine] exchanges the process data of operational slaves, and the mailbox traffic in the space left
    - [Master] coordinates all of these and exposes the process image

    Frames can be exchanged over raw ethernet, UDP, or with a simulated segment of slaves, see [socket].
*/

#![allow(non_upper_case_globals)]

pub mod socket;
pub mod data;
pub mod error;
pub mod registers;
pub mod eeprom;
pub mod frame;
pub mod queue;
pub mod rawmaster;
pub mod config;
pub mod sii;
pub mod cache;
pub mod mailbox;
pub mod mapping;
pub mod clock;
pub mod slave;
pub mod scanner;
pub mod cyclic;
pub mod master;

pub use crate::data::{PduData, Field};
pub use crate::error::{EthercatError, EthercatResult, Fault, FaultKind};
pub use crate::socket::*;
pub use crate::rawmaster::{RawMaster, PduAnswer};
pub use crate::frame::{PduCommand, SlaveAddress};
pub use crate::queue::{Datagram, Response, Latency};
pub use crate::config::*;
pub use crate::sii::{Identity, SiiImage};
pub use crate::cache::{SiiCache, SiiOverride, DirectoryOverride, CacheKey};
pub use crate::mapping::{ProcessImage, Region};
pub use crate::mailbox::{MailboxType, Ticket};
pub use crate::clock::{ClockSync, FreeRun, ReferenceClock};
pub use crate::slave::{Slave, SlaveState, SlaveInfo, SlaveDiagnostics, Capabilities, SlaveError};
pub use crate::scanner::{TopologySnapshot, Gap};
pub use crate::cyclic::{CyclicEngine, CycleReport};
pub use crate::master::{Master, MasterState};
