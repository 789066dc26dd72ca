//! Gratuitous ARP announcement
//!
//! After the container end is wired up, one broadcast ARP request
//! carrying the new MAC-to-IP binding goes out so switches and
//! neighbors update their tables before the pod's first organic
//! packet. The frame is built by hand and written to a raw packet
//! socket; callers must already be inside the container namespace.

use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tracing::debug;

use crate::error::CniError;

/// Ethernet header plus IPv4-over-ethernet ARP payload
const GARP_FRAME_LEN: usize = 42;

const ETH_BROADCAST: [u8; 6] = [0xff; 6];

const ETHERTYPE_ARP: u16 = 0x0806;

#[repr(C)]
struct IfReqHwaddr {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_hwaddr: libc::sockaddr,
    _pad: [u8; 24 - std::mem::size_of::<libc::sockaddr>()],
}

fn write_ifname(dst: &mut [libc::c_char; libc::IFNAMSIZ], name: &str) -> Result<(), CniError> {
    if name.len() >= libc::IFNAMSIZ {
        return Err(CniError::arp_error(&format!("interface name too long: {}", name)));
    }
    for b in dst.iter_mut() {
        *b = 0;
    }
    for (i, b) in name.as_bytes().iter().enumerate() {
        dst[i] = *b as libc::c_char;
    }
    Ok(())
}

fn last_os_error(msg: &str) -> CniError {
    CniError::arp_error(msg).with_details(&std::io::Error::last_os_error().to_string())
}

/// Read an interface's MAC via `SIOCGIFHWADDR`
fn read_mac(ifname: &str) -> Result<[u8; 6], CniError> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(last_os_error("failed to open ioctl socket"));
    }
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut ifr = IfReqHwaddr {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_hwaddr: libc::sockaddr { sa_family: 0, sa_data: [0; 14] },
        _pad: [0; 24 - std::mem::size_of::<libc::sockaddr>()],
    };
    write_ifname(&mut ifr.ifr_name, ifname)?;

    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFHWADDR as _, &mut ifr) };
    if ret < 0 {
        return Err(last_os_error(&format!("failed to read mac of {}", ifname)));
    }

    let mut mac = [0u8; 6];
    for (i, slot) in mac.iter_mut().enumerate() {
        *slot = ifr.ifr_hwaddr.sa_data[i] as u8;
    }
    Ok(mac)
}

/// Build the announcement frame
///
/// A gratuitous request: sender and target protocol addresses both
/// carry the announced IP, the target hardware address is broadcast.
fn build_garp_frame(mac: [u8; 6], ip: Ipv4Addr) -> [u8; GARP_FRAME_LEN] {
    let mut frame = [0u8; GARP_FRAME_LEN];
    let ip = ip.octets();

    frame[0..6].copy_from_slice(&ETH_BROADCAST);
    frame[6..12].copy_from_slice(&mac);
    frame[12..14].copy_from_slice(&ETHERTYPE_ARP.to_be_bytes());

    frame[14..16].copy_from_slice(&1u16.to_be_bytes()); // htype: ethernet
    frame[16..18].copy_from_slice(&0x0800u16.to_be_bytes()); // ptype: ipv4
    frame[18] = 6; // hlen
    frame[19] = 4; // plen
    frame[20..22].copy_from_slice(&1u16.to_be_bytes()); // op: request
    frame[22..28].copy_from_slice(&mac);
    frame[28..32].copy_from_slice(&ip);
    frame[32..38].copy_from_slice(&ETH_BROADCAST);
    frame[38..42].copy_from_slice(&ip);

    frame
}

/// Broadcast one gratuitous ARP for `ip` out `ifname`
pub fn announce(ifname: &str, ip: Ipv4Addr) -> Result<(), CniError> {
    let mac = read_mac(ifname)?;
    let index = nix::net::if_::if_nametoindex(ifname).map_err(|e| {
        CniError::arp_error(&format!("failed to resolve index of {}", ifname))
            .with_details(&e.to_string())
    })?;

    let protocol = ETHERTYPE_ARP.to_be() as libc::c_int;
    let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol) };
    if fd < 0 {
        return Err(last_os_error("failed to open packet socket"));
    }
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    let frame = build_garp_frame(mac, ip);

    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::c_ushort;
    addr.sll_protocol = ETHERTYPE_ARP.to_be();
    addr.sll_ifindex = index as libc::c_int;
    addr.sll_halen = 6;
    addr.sll_addr[..6].copy_from_slice(&ETH_BROADCAST);

    let sent = unsafe {
        libc::sendto(
            sock.as_raw_fd(),
            frame.as_ptr() as *const libc::c_void,
            frame.len(),
            0,
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if sent < 0 {
        return Err(last_os_error(&format!("failed to send gratuitous arp on {}", ifname)));
    }
    if sent as usize != frame.len() {
        return Err(CniError::arp_error(&format!("short gratuitous arp write on {}", ifname)));
    }

    debug!(ifname, ip = %ip, "sent gratuitous arp");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garp_frame_layout() {
        let mac = [0x02, 0xab, 0xc1, 0x23, 0xde, 0xf4];
        let frame = build_garp_frame(mac, Ipv4Addr::new(10, 0, 4, 5));

        assert_eq!(frame.len(), GARP_FRAME_LEN);
        assert_eq!(&frame[0..6], &[0xff; 6], "destination is broadcast");
        assert_eq!(&frame[6..12], &mac);
        assert_eq!(&frame[12..14], &[0x08, 0x06], "ethertype arp");
        assert_eq!(&frame[14..22], &[0, 1, 8, 0, 6, 4, 0, 1], "header and request op");
        assert_eq!(&frame[22..28], &mac, "sender hardware address");
        assert_eq!(&frame[28..32], &[10, 0, 4, 5], "sender protocol address");
        assert_eq!(&frame[32..38], &[0xff; 6]);
        assert_eq!(&frame[38..42], &frame[28..32], "target mirrors sender");
    }

    #[test]
    fn test_read_mac_loopback() {
        // loopback reports an all-zero hardware address
        assert_eq!(read_mac("lo").unwrap(), [0u8; 6]);
    }

    #[test]
    fn test_read_mac_missing_interface() {
        assert!(read_mac("tn-arp-missing0").is_err());
    }

    #[test]
    fn test_ifname_too_long() {
        let mut buf = [0; libc::IFNAMSIZ];
        assert!(write_ifname(&mut buf, "interface-name-way-too-long").is_err());
    }

    #[test]
    #[ignore = "requires CAP_NET_RAW"]
    fn test_announce_loopback() {
        announce("lo", Ipv4Addr::new(127, 0, 0, 1)).unwrap();
    }
}
