//! DNAT bootstrap through a TUN device.
//!
//! The station never delivers the fabricated packet anywhere useful; its
//! whole purpose is to seed kernel conntrack state so the client's real
//! packets to the phantom get rerouted to the station's shared UDP socket.
//! Injection is behind a trait so tests can capture packets instead of
//! needing a TUN device and CAP_NET_ADMIN.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Payload carried by every DNAT seed packet.
const SEED_PAYLOAD: &[u8] = b"Hello world";

/// Writes raw IP packets into the network stack.
pub trait PacketInjector: Send + Sync {
    /// Inject one IPv4 packet.
    fn inject(&self, packet: &[u8]) -> Result<()>;
}

/// Installs DNAT entries by injecting fabricated client→phantom packets.
pub struct Dnat {
    injector: Box<dyn PacketInjector>,
}

impl Dnat {
    /// Open the per-worker TUN device named from `CJ_CORECOUNT` and
    /// `OFFSET` and build the injector on it. Fatal at startup on failure.
    #[cfg(target_os = "linux")]
    pub fn from_env() -> Result<Dnat> {
        let core_count: i32 = read_env_int("CJ_CORECOUNT")?;
        let offset: i32 = read_env_int("OFFSET")?;
        let name = format!("tun{}", offset + core_count);
        let tun = TunInjector::open(&name)?;
        tracing::info!(device = %name, "dnat tun device up");
        Ok(Dnat {
            injector: Box::new(tun),
        })
    }

    /// Build a DNAT shim over any injector (tests use a capturing one).
    pub fn with_injector(injector: Box<dyn PacketInjector>) -> Dnat {
        Dnat { injector }
    }

    /// Write one fabricated `src → dst` UDP packet.
    pub fn add_entry(&self, src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16) -> Result<()> {
        let packet = build_udp_packet(src, sport, dst, dport, SEED_PAYLOAD);
        self.injector.inject(&packet)
    }
}

#[cfg(target_os = "linux")]
fn read_env_int(key: &str) -> Result<i32> {
    std::env::var(key)
        .map_err(|_| Error::config(format!("{key} not set")))?
        .parse()
        .map_err(|_| Error::config(format!("{key} is not an integer")))
}

/// Build an IPv4+UDP packet with correct checksums.
pub fn build_udp_packet(
    src: Ipv4Addr,
    sport: u16,
    dst: Ipv4Addr,
    dport: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let total_len = 20 + udp_len;
    let mut packet = vec![0u8; total_len];

    // IPv4 header
    packet[0] = 0x45; // version 4, IHL 5
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[8] = 64; // TTL
    packet[9] = 17; // UDP
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    let ip_csum = checksum(&packet[..20]);
    packet[10..12].copy_from_slice(&ip_csum.to_be_bytes());

    // UDP header
    packet[20..22].copy_from_slice(&sport.to_be_bytes());
    packet[22..24].copy_from_slice(&dport.to_be_bytes());
    packet[24..26].copy_from_slice(&(udp_len as u16).to_be_bytes());
    packet[28..].copy_from_slice(payload);

    // UDP checksum over the pseudo header + UDP segment
    let mut pseudo = Vec::with_capacity(12 + udp_len);
    pseudo.extend_from_slice(&src.octets());
    pseudo.extend_from_slice(&dst.octets());
    pseudo.push(0);
    pseudo.push(17);
    pseudo.extend_from_slice(&(udp_len as u16).to_be_bytes());
    pseudo.extend_from_slice(&packet[20..]);
    let mut udp_csum = checksum(&pseudo);
    if udp_csum == 0 {
        udp_csum = 0xffff;
    }
    packet[26..28].copy_from_slice(&udp_csum.to_be_bytes());

    packet
}

/// RFC 1071 ones-complement sum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// A TUN device injector.
#[cfg(target_os = "linux")]
pub struct TunInjector {
    tun: std::fs::File,
}

#[cfg(target_os = "linux")]
impl TunInjector {
    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const IFF_TUN: u16 = 0x0001;
    const IFF_NO_PI: u16 = 0x1000;

    /// Open `/dev/net/tun`, claim the named interface, and bring it up.
    pub fn open(name: &str) -> Result<TunInjector> {
        use std::os::fd::AsRawFd;

        if name.len() >= libc::IFNAMSIZ {
            return Err(Error::dnat(format!("interface name too long: {name}")));
        }
        let tun = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(|e| Error::dnat(format!("open /dev/net/tun: {e}")))?;

        let mut ifreq = [0u8; 0x28];
        ifreq[..name.len()].copy_from_slice(name.as_bytes());
        ifreq[0x10..0x12].copy_from_slice(&(Self::IFF_TUN | Self::IFF_NO_PI).to_le_bytes());

        let rc = unsafe {
            libc::ioctl(tun.as_raw_fd(), Self::TUNSETIFF, ifreq.as_mut_ptr())
        };
        if rc < 0 {
            return Err(Error::dnat(format!(
                "TUNSETIFF {name}: {}",
                std::io::Error::last_os_error()
            )));
        }

        Self::set_up(&tun, name)?;
        Ok(TunInjector { tun })
    }

    /// Add IFF_UP to the interface flags.
    fn set_up(tun: &std::fs::File, name: &str) -> Result<()> {
        use std::os::fd::AsRawFd;

        let mut ifreq = [0u8; 0x28];
        ifreq[..name.len()].copy_from_slice(name.as_bytes());

        let rc = unsafe {
            libc::ioctl(tun.as_raw_fd(), libc::SIOCGIFFLAGS, ifreq.as_mut_ptr())
        };
        if rc < 0 {
            return Err(Error::dnat(format!(
                "SIOCGIFFLAGS {name}: {}",
                std::io::Error::last_os_error()
            )));
        }

        let mut flags = u16::from_le_bytes([ifreq[0x10], ifreq[0x11]]);
        flags |= libc::IFF_UP as u16;
        ifreq[0x10..0x12].copy_from_slice(&flags.to_le_bytes());

        let rc = unsafe {
            libc::ioctl(tun.as_raw_fd(), libc::SIOCSIFFLAGS, ifreq.as_mut_ptr())
        };
        if rc < 0 {
            return Err(Error::dnat(format!(
                "SIOCSIFFLAGS {name}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl PacketInjector for TunInjector {
    fn inject(&self, packet: &[u8]) -> Result<()> {
        use std::io::Write;
        (&self.tun)
            .write_all(packet)
            .map_err(|e| Error::dnat(format!("tun write: {e}")))
    }
}
