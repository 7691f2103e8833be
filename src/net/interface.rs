use anyhow::{Context, Result, anyhow};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socket};
use std::{
    io,
    mem,
    net::Ipv4Addr,
    os::fd::{AsRawFd, OwnedFd},
};

/// An AF_INET datagram socket used purely as a handle for interface and
/// routing ioctls.
pub struct InterfaceControl {
    fd: OwnedFd,
}

impl InterfaceControl {
    pub fn new() -> Result<Self> {
        let fd = socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("failed to open interface control socket")?;
        Ok(Self { fd })
    }

    pub fn bring_up(&self, name: &str) -> Result<()> {
        let mut req = ifreq(name)?;
        self.ioctl(libc::SIOCGIFFLAGS as _, &mut req)
            .context(format!("failed to read flags of {}", name))?;

        // SAFETY: SIOCGIFFLAGS filled the flags member of the union.
        unsafe {
            req.ifr_ifru.ifru_flags |=
                (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        }
        self.ioctl(libc::SIOCSIFFLAGS as _, &mut req)
            .context(format!("failed to bring up {}", name))
    }

    pub fn set_address(&self, name: &str, addr: Ipv4Addr) -> Result<()> {
        let mut req = ifreq(name)?;
        req.ifr_ifru.ifru_addr = sockaddr(addr);
        self.ioctl(libc::SIOCSIFADDR as _, &mut req)
            .context(format!("failed to set address {} on {}", addr, name))
    }

    pub fn set_netmask(&self, name: &str, mask: Ipv4Addr) -> Result<()> {
        let mut req = ifreq(name)?;
        req.ifr_ifru.ifru_netmask = sockaddr(mask);
        self.ioctl(libc::SIOCSIFNETMASK as _, &mut req)
            .context(format!("failed to set netmask {} on {}", mask, name))
    }

    pub fn add_default_route(&self, gateway: Ipv4Addr) -> Result<()> {
        // SAFETY: rtentry is plain old data; all-zero is a valid value.
        let mut route: libc::rtentry = unsafe { mem::zeroed() };
        route.rt_dst = sockaddr(Ipv4Addr::UNSPECIFIED);
        route.rt_genmask = sockaddr(Ipv4Addr::UNSPECIFIED);
        route.rt_gateway = sockaddr(gateway);
        route.rt_flags = (libc::RTF_UP | libc::RTF_GATEWAY) as _;

        // SAFETY: SIOCADDRT reads a fully initialised rtentry; rt_dev is
        // null so the kernel picks the interface from the gateway.
        let ret = unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                libc::SIOCADDRT as _,
                &route as *const libc::rtentry,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error()).context(format!(
                "failed to add default route via {}",
                gateway
            ));
        }
        Ok(())
    }

    fn ioctl(
        &self,
        request: libc::Ioctl,
        req: &mut libc::ifreq,
    ) -> io::Result<()> {
        // SAFETY: every request issued here takes a pointer to an ifreq,
        // which lives for the duration of the call.
        let ret = unsafe {
            libc::ioctl(self.fd.as_raw_fd(), request, req as *mut libc::ifreq)
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn ifreq(name: &str) -> Result<libc::ifreq> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ || bytes.contains(&0) {
        return Err(anyhow!("Invalid interface name: ({})", name));
    }

    // SAFETY: ifreq is plain old data; all-zero is a valid value.
    let mut req: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(req)
}

fn sockaddr(addr: Ipv4Addr) -> libc::sockaddr {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from(addr).to_be(),
        },
        sin_zero: [0; 8],
    };
    // SAFETY: sockaddr_in and sockaddr have the same size, and the kernel
    // reads the address family first.
    unsafe { mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sin) }
}

/// The dotted netmask for a CIDR prefix length.
pub fn netmask(prefix_len: u8) -> Result<Ipv4Addr> {
    if prefix_len > 32 {
        return Err(anyhow!("Invalid prefix length: {}", prefix_len));
    }
    let bits = u32::MAX
        .checked_shl(32 - u32::from(prefix_len))
        .unwrap_or(0);
    Ok(Ipv4Addr::from(bits))
}
