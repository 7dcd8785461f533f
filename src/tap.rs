//! Opening and configuring a Layer-2 virtual interface, and reading/writing
//! whole Ethernet frames through it.
//!
//! Platform selection happens once at startup ([`open_platform_tap`]); the
//! rest of the core only ever depends on the [`TapEndpoint`] trait.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::Command;

use nix::libc;
use nix::unistd::Uid;
use tracing::info;

use crate::error::TapError;
use crate::mac::MacAddr;

/// A 2000-byte read/write covers the reference MTU plus Ethernet header;
/// one OS read/write always yields exactly one whole frame on a TAP fd.
const TAP_READ_LEN: usize = 2000;

/// Parameters needed to open and configure the TAP device, taken from the
/// `[tap]` and `[config]` sections of the startup configuration (§6).
#[derive(Clone, Debug)]
pub struct TapConfig {
    pub devnum: String,
    pub ip: std::net::Ipv4Addr,
    pub mask: std::net::Ipv4Addr,
    pub owner_user: String,
}

impl TapConfig {
    pub fn interface_name(&self) -> String {
        format!("tap{}", self.devnum)
    }
}

/// Something that behaves like a TAP device: whole-frame read/write plus a
/// raw fd for the event loop to poll.
pub trait TapEndpoint: Send {
    fn read_frame(&mut self) -> io::Result<Vec<u8>>;
    fn write(&mut self, frame: &[u8]) -> io::Result<()>;
    fn raw_fd(&self) -> RawFd;
    fn mac(&self) -> MacAddr;
    fn ip(&self) -> std::net::Ipv4Addr;
}

fn run_ifconfig(iface: &str, ip: std::net::Ipv4Addr, mask: std::net::Ipv4Addr) -> Result<(), TapError> {
    let command_str = format!("ifconfig {iface} {ip} netmask {mask} up");
    let status = Command::new("ifconfig")
        .args([iface, &ip.to_string(), "netmask", &mask.to_string(), "up"])
        .status()
        .map_err(|source| TapError::Command {
            command: command_str.clone(),
            source,
        })?;
    if !status.success() {
        return Err(TapError::CommandFailed {
            command: command_str,
            status: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

fn lookup_uid(name: &str) -> Result<Uid, TapError> {
    let user = nix::unistd::User::from_name(name)
        .map_err(|source| TapError::UserLookup {
            name: name.to_string(),
            source,
        })?
        .ok_or_else(|| TapError::NoSuchUserOrGroup(name.to_string()))?;
    Ok(user.uid)
}

/// Linux TAP device opened through `/dev/net/tun` and the TUN/TAP control
/// ioctls, per `linux/if_tun.h`.
pub struct LinuxTap {
    file: File,
    mac: MacAddr,
    ip: std::net::Ipv4Addr,
}

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
}

nix::ioctl_write_ptr!(tunsetiff, b'T', 202, IfReq);
nix::ioctl_write_int!(tunsetowner, b'T', 204);

impl LinuxTap {
    pub fn open(cfg: &TapConfig) -> Result<Self, TapError> {
        let iface = cfg.interface_name();
        let device_path = "/dev/net/tun";
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .map_err(|source| TapError::Open {
                path: device_path.to_string(),
                source,
            })?;

        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TAP | IFF_NO_PI,
        };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(iface.bytes()) {
            *dst = src as libc::c_char;
        }

        unsafe { tunsetiff(file.as_raw_fd(), &ifr as *const IfReq) }.map_err(|source| TapError::Ioctl {
            name: "TUNSETIFF",
            path: device_path.to_string(),
            source,
        })?;

        let uid = lookup_uid(&cfg.owner_user)?;
        unsafe { tunsetowner(file.as_raw_fd(), uid.as_raw() as libc::c_ulong) }.map_err(|source| {
            TapError::Ioctl {
                name: "TUNSETOWNER",
                path: device_path.to_string(),
                source,
            }
        })?;

        run_ifconfig(&iface, cfg.ip, cfg.mask)?;

        let address_path = format!("/sys/class/net/{iface}/address");
        let raw = std::fs::read_to_string(&address_path).map_err(|source| TapError::ReadMac {
            path: address_path.clone(),
            source,
        })?;
        let mac = MacAddr::parse_loose(raw.trim()).ok_or_else(|| TapError::ParseMac {
            path: address_path.clone(),
            raw: raw.trim().to_string(),
        })?;

        info!(iface = %iface, mac = %mac, ip = %cfg.ip, "opened linux TAP device");

        Ok(LinuxTap {
            file,
            mac,
            ip: cfg.ip,
        })
    }
}

impl TapEndpoint for LinuxTap {
    fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; TAP_READ_LEN];
        let n = self.file.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write(&mut self, frame: &[u8]) -> io::Result<()> {
        self.file.write_all(frame)
    }

    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn ip(&self) -> std::net::Ipv4Addr {
        self.ip
    }
}

/// Darwin/BSD TAP device, opened as `/dev/<iface>` (e.g. `/dev/tap0`); no
/// ioctl dance is needed, the kernel hands back a ready Ethernet byte
/// stream, but the MAC must be scraped from `ifconfig` output since there
/// is no `/sys`.
pub struct BsdTap {
    file: File,
    mac: MacAddr,
    ip: std::net::Ipv4Addr,
}

impl BsdTap {
    pub fn open(cfg: &TapConfig) -> Result<Self, TapError> {
        let iface = cfg.interface_name();
        let device_path = format!("/dev/{iface}");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device_path)
            .map_err(|source| TapError::Open {
                path: device_path.clone(),
                source,
            })?;

        run_ifconfig(&iface, cfg.ip, cfg.mask)?;

        let command_str = format!("ifconfig {iface}");
        let output = Command::new("ifconfig")
            .arg(&iface)
            .output()
            .map_err(|source| TapError::Command {
                command: command_str.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(TapError::CommandFailed {
                command: command_str,
                status: output.status.code().unwrap_or(-1),
            });
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let mac = text
            .lines()
            .find_map(|line| {
                line.split_whitespace()
                    .find_map(|tok| MacAddr::parse_loose(tok).filter(|_| tok.contains(':')))
            })
            .ok_or_else(|| TapError::ParseMac {
                path: command_str.clone(),
                raw: text.to_string(),
            })?;

        info!(iface = %iface, mac = %mac, ip = %cfg.ip, "opened bsd TAP device");

        Ok(BsdTap {
            file,
            mac,
            ip: cfg.ip,
        })
    }
}

impl TapEndpoint for BsdTap {
    fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; TAP_READ_LEN];
        let n = self.file.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write(&mut self, frame: &[u8]) -> io::Result<()> {
        self.file.write_all(frame)
    }

    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn ip(&self) -> std::net::Ipv4Addr {
        self.ip
    }
}

/// Tagged-variant dispatch on the host OS, chosen once at startup.
pub fn open_platform_tap(cfg: &TapConfig) -> Result<Box<dyn TapEndpoint>, TapError> {
    if cfg!(target_os = "linux") {
        Ok(Box::new(LinuxTap::open(cfg)?))
    } else if cfg!(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd")) {
        Ok(Box::new(BsdTap::open(cfg)?))
    } else {
        Err(TapError::PlatformUnsupported)
    }
}
