//! The mDNS socket: multicast group membership plus per-datagram
//! destination-address retrieval.
//!
//! The engine must know whether each datagram was addressed to the
//! `224.0.0.251` group or unicast to this host, which takes `IP_PKTINFO`
//! and `recvmsg` control-message parsing; socket2 configures the socket and
//! `libc` supplies the one call it does not surface.

use std::io;
use std::mem::size_of;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::time::Duration;

use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use pnet::datalink;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::debug;

pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;

pub struct MdnsSocket {
    socket: Socket,
    /// Serialises writes; queries, answers and delayed answers may be sent
    /// from any thread.
    send_lock: Mutex<()>,
}

impl MdnsSocket {
    /// Bind :5353, join the group with loopback disabled, and enable
    /// per-packet destination info. Any failure here is fatal at startup.
    pub fn open() -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("failed to create mDNS socket")?;
        socket
            .set_reuse_address(true)
            .context("failed to set SO_REUSEADDR on mDNS socket")?;
        socket
            .bind(&SockAddr::from(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                MDNS_PORT,
            )))
            .context("failed to bind mDNS socket")?;
        socket
            .join_multicast_v4(&MDNS_GROUP, &Ipv4Addr::UNSPECIFIED)
            .context("failed to join mDNS multicast group")?;
        socket
            .set_multicast_loop_v4(false)
            .context("failed to disable multicast loopback")?;
        enable_pktinfo(&socket).context("failed to enable IP_PKTINFO on mDNS socket")?;
        // short timeout so the receive thread can poll for cancellation
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .context("failed to set mDNS socket read timeout")?;

        Ok(MdnsSocket {
            socket,
            send_lock: Mutex::new(()),
        })
    }

    /// Send one datagram. Failures are logged and otherwise ignored; the
    /// next query round retries.
    pub fn send_to(&self, bytes: &[u8], dest: SocketAddrV4) {
        let _guard = self.send_lock.lock();
        if let Err(e) = self.socket.send_to(bytes, &SockAddr::from(dest)) {
            debug!(dest = %dest, error = %e, "mDNS send failed");
        }
    }

    /// Blocking receive returning (length, sender, destination address).
    pub fn recv_with_destination(
        &self,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddrV4, Ipv4Addr)> {
        let mut sender: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut control = [0u8; 64];

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut sender as *mut _ as *mut libc::c_void;
        msg.msg_namelen = size_of::<libc::sockaddr_in>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len() as _;

        let received = unsafe { libc::recvmsg(self.socket.as_raw_fd(), &mut msg, 0) };
        if received < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut destination = None;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::IPPROTO_IP && (*cmsg).cmsg_type == libc::IP_PKTINFO {
                    let info =
                        std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo);
                    destination = Some(Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr)));
                    break;
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
        let destination = destination
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "datagram without pktinfo"))?;

        let sender = SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be(sender.sin_addr.s_addr)),
            u16::from_be(sender.sin_port),
        );
        Ok((received as usize, sender, destination))
    }
}

fn enable_pktinfo(socket: &Socket) -> io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            &on as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// This host's IPv4 address on the interface whose subnet contains `peer`,
/// used as the rdata of generated A answers. Unspecified when no interface
/// matches.
pub fn local_addr_on_subnet(peer: Ipv4Addr) -> Ipv4Addr {
    for interface in datalink::interfaces() {
        for network in &interface.ips {
            if let IpNetwork::V4(network) = network {
                if network.contains(peer) {
                    return network.ip();
                }
            }
        }
    }
    Ipv4Addr::UNSPECIFIED
}
