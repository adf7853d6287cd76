use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use core::time::Duration;
use packed_struct::prelude::*;
use log::*;
use super::{EthercatSocket, ETHERCAT_ETHERTYPE};


/// packet type set by the kernel on frames this host sent itself, see `man packet`
const PACKET_OUTGOING: u8 = 4;
/// ethernet payload size on usual networks
const ETHERNET_MTU: usize = 1500;
/// smallest ethernet frame without its checksum, shorter frames must be padded
const ETHERNET_MIN_FRAME: usize = 60;
/// size of [EthernetHeader] once packed
const ETHERNET_HEADER_SIZE: usize = 14;

const MASTER_MAC: [u8; 6] = [0x12, 0x10, 0x10, 0x10, 0x10, 0x10];
const BROADCAST_MAC: [u8; 6] = [0xff; 6];

/// `AF_PACKET` socket bound to one network interface, exchanging ethercat frames as Ethernet II payloads (linux only)
#[derive(Debug)]
pub struct EthernetSocket {
    lower: libc::c_int,
    ifindex: libc::c_int,
}

impl EthernetSocket {
    pub fn new(interface: &str) -> io::Result<Self> {
        let lower = unsafe {
            let lower = libc::socket(
                // Ethernet II frames
                libc::AF_PACKET,
                libc::SOCK_RAW,
                ETHERCAT_ETHERTYPE.to_be() as i32,
            );
            if lower == -1 {
                return Err(io::Error::last_os_error());
            }
            lower
        };
        // the descriptor is closed on drop from now on, even if the following fails
        let mut new = EthernetSocket {lower, ifindex: 0};
        let mut ifreq = ifreq_for(interface)?;
        new.ifindex = ifreq_ioctl(new.lower, &mut ifreq, libc::SIOCGIFINDEX)?;

        // bind
        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: ETHERCAT_ETHERTYPE.to_be(),
            sll_ifindex: new.ifindex,
            sll_hatype: 1,
            sll_pkttype: 0,
            sll_halen: 6,
            sll_addr: [0; 8],
        };
        unsafe {
            let res = libc::bind(
                new.lower,
                &sockaddr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            );
            if res == -1 {
                return Err(io::Error::last_os_error());
            }
        }
        info!("raw ethercat socket bound to {} (index {})", interface, new.ifindex);
        Ok(new)
    }

    /// wait for the socket to be readable, returns false on timeout
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut fds = libc::pollfd {
            fd: self.lower,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let res = unsafe {libc::ppoll(&mut fds, 1, &timeout, std::ptr::null())};
        if res < 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::Interrupted  {return Ok(false)}
            return Err(error);
        }
        Ok(res > 0)
    }
}

impl Drop for EthernetSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.lower);
        }
    }
}

impl AsRawFd for EthernetSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.lower
    }
}

impl EthercatSocket for EthernetSocket {
    fn receive(&self, data: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let header_size = ETHERNET_HEADER_SIZE;
        let mut packed = [0u8; 4096];
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if ! self.wait_readable(remaining)?
                {return Ok(None)}

            let mut source: libc::sockaddr_ll = unsafe {std::mem::zeroed()};
            let mut source_len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
            let len = unsafe {
                libc::recvfrom(
                    self.lower,
                    packed.as_mut_ptr() as *mut libc::c_void,
                    packed.len(),
                    0,
                    &mut source as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                    &mut source_len,
                )
            };
            if len < 0 {
                return Err(io::Error::last_os_error());
            }
            let len = len as usize;
            // our own frames are looped back by the kernel
            if source.sll_pkttype == PACKET_OUTGOING || len < header_size
                {continue}

            let header = EthernetHeader::unpack_from_slice(&packed[.. header_size])
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed ethernet header"))?;
            if header.ty != ETHERCAT_ETHERTYPE
                {continue}
            trace!("received ethernet frame from {:x?}", header.src);

            let content = &packed[header_size .. len];
            let size = content.len().min(data.len());
            data[.. size].copy_from_slice(&content[.. size]);
            return Ok(Some(size));
        }
    }
    fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut packed = heapless::Vec::<u8, 4096>::new();
        let header = EthernetHeader {
            dst: BROADCAST_MAC,
            src: MASTER_MAC,
            ty: ETHERCAT_ETHERTYPE,
            }.pack()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "cannot pack ethernet header"))?;
        packed.extend_from_slice(&header)
            .and_then(|_| packed.extend_from_slice(data))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too big for ethernet"))?;
        if packed.len() < ETHERNET_MIN_FRAME {
            packed.resize(ETHERNET_MIN_FRAME, 0)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "cannot pad frame"))?;
        }

        let len = unsafe {
            libc::write(
                self.lower,
                packed.as_ptr() as *const libc::c_void,
                packed.len(),
            )
        };
        if len < 0 {
            Err(io::Error::last_os_error())
        }
        else if len as usize != packed.len() {
            Err(io::Error::new(io::ErrorKind::WriteZero, "ethernet frame partially sent"))
        }
        else {
            Ok(())
        }
    }
    fn max_frame(&self) -> usize  {ETHERNET_MTU}
}


// intermediate C-like structures and functions

#[repr(C)]
#[derive(Debug)]
struct ifreq {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_data: libc::c_int, /* ifr_ifindex or ifr_mtu */
}

fn ifreq_ioctl(
    lower: libc::c_int,
    ifreq: &mut ifreq,
    cmd: libc::c_ulong,
) -> io::Result<libc::c_int> {
    let res = unsafe {libc::ioctl(lower, cmd, ifreq as *mut ifreq)};
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(ifreq.ifr_data)
}

fn ifreq_for(name: &str) -> io::Result<ifreq> {
    let mut ifreq = ifreq {
        ifr_name: [0; libc::IF_NAMESIZE],
        ifr_data: 0,
    };
    // the name must stay nul terminated
    if name.len() >= libc::IF_NAMESIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "interface name too long"));
    }
    for (i, byte) in name.as_bytes().iter().enumerate() {
        ifreq.ifr_name[i] = *byte as libc::c_char
    }
    Ok(ifreq)
}


#[derive(PackedStruct, Clone, Debug)]
#[packed_struct(size_bytes="14", bit_numbering = "lsb0", endian = "msb")]
struct EthernetHeader {
    #[packed_field(bytes="8:13")]  dst: [u8;6],
    #[packed_field(bytes="2:7")]  src: [u8;6],
    #[packed_field(bytes="0:1")]  ty: u16,
}
