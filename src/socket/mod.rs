/*!
    This module provide the trait [EthercatSocket], and several implementors allowing to use different physical layers for ethercat communication.

    - UDP socket allows to run multiple master, one ethercat segment each, on the same ethernet network (and same machine ethernet port). But exposes the ethercat network to possible delays due to ethernet packet collisions.
    - Raw socket allows one only master with one only ethercat segment on the ethernet network. It ensure no communication delay with an ethercat segment.
    - Simulated socket runs an in-memory segment of slaves, answering frames the way real slaves would. It is meant for tests and demos.

    | socket type |  allowed masters on network  |  allowed EC segments on network |  possible jitter |  other protocols allowed on same network |
    |-------------|------------------------------|---------------------------------|------------------|------------------------------------------|
    | [EthernetSocket] | 1                       | 1                               | none             | all non-ethercat protocols               |
    | [UdpSocket] | 2^32                         | 2^32                            | depend on trafic | all                                      |
    | [SimulatedSocket] | 1                      | 1                               | none             | none                                     |
*/

mod udp;
#[cfg(target_os = "linux")]
mod ethernet;
mod simulated;

pub use udp::UdpSocket;
#[cfg(target_os = "linux")]
pub use ethernet::EthernetSocket;
pub use simulated::*;

use std::io;
use core::time::Duration;

/// ethernet type of ethercat frames, also used as UDP port
pub const ETHERCAT_ETHERTYPE: u16 = 0x88a4;

/**
    transport carrying ethercat frames, ETG.1000.4 defines Ethernet and UDP encapsulations

    Both methods are blocking, they are called by the transport driver of [crate::RawMaster] which runs in its own thread.
*/
pub trait EthercatSocket {
    /**
        receive one frame into the given buffer, starting at the ethercat header

        returns the frame size, or `None` if no frame arrived before the timeout. Medium specific headers are removed by the implementor.
    */
    fn receive(&self, data: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;

    /// send the whole buffer as one frame, the implementor adds its medium specific headers
    fn send(&self, data: &[u8]) -> io::Result<()>;

    /// largest ethercat frame this medium can send
    fn max_frame(&self) -> usize;
}
