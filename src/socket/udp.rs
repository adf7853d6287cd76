use std::io;
use std::net::{SocketAddr, IpAddr, Ipv4Addr};
use core::time::Duration;
use log::*;
use super::{EthercatSocket, ETHERCAT_ETHERTYPE};

/// UDP payload size on usual networks
const UDP_MAX_FRAME: usize = 1472;

/**
    UDP socket with fixed port, allowing ethercat com through a regular switch
*/
pub struct UdpSocket {
    socket: std::net::UdpSocket,
    address: SocketAddr,

    filter_address: bool,
}

impl UdpSocket {
    /// according to ETG.1000.4 only IPv4 is supported, and port is fixed, hence this function only requires the host address
    pub fn new(segment: Ipv4Addr) -> io::Result<Self> {
        let address = SocketAddr::new(IpAddr::V4(segment), ETHERCAT_ETHERTYPE);
        let socket = std::net::UdpSocket::bind(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                ETHERCAT_ETHERTYPE,
                ))?;
        Ok(Self {
            address,
            socket,
            filter_address: false,
        })
    }
    /// ignore frames not coming from the segment address
    pub fn set_filter_address(&mut self, enable: bool) {
        self.filter_address = enable;
    }
}

impl EthercatSocket for UdpSocket {
    fn receive(&self, data: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        // a zero timeout would make the socket blocking
        self.socket.set_read_timeout(Some(timeout.max(Duration::from_micros(1))))?;
        loop {
            match self.socket.recv_from(data) {
                Ok((size, source)) => {
                    if self.filter_address && source != self.address {
                        debug!("ignoring udp frame from {}", source);
                        continue;
                    }
                    return Ok(Some(size));
                },
                Err(error) if matches!(error.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
                    => return Ok(None),
                Err(error) => return Err(error),
            }
        }
    }
    fn send(&self, data: &[u8]) -> io::Result<()> {
        let sent = self.socket.send_to(data, self.address)?;
        if sent != data.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "udp frame partially sent"));
        }
        Ok(())
    }
    fn max_frame(&self) -> usize  {UDP_MAX_FRAME}
}
