//! Probe-run socket acquisition (§4.C step 1 `SOCKET_INIT`).

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::warn;

const WANTED_BUFFER_SIZE: usize = 65535;

/// Create the single non-blocking UDP socket a probe run sends and
/// receives on. Requested buffer sizes are best-effort: the kernel may
/// grant less, which is logged but never treated as a failure (§4.C step 1).
pub(super) fn bind_probe_socket() -> io::Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_nonblocking(true)?;
    let bind_addr: SocketAddr = "0.0.0.0:0".parse().expect("valid literal");
    sock.bind(&bind_addr.into())?;

    if let Err(err) = sock.set_recv_buffer_size(WANTED_BUFFER_SIZE) {
        warn!("kernel denied recv buffer size {WANTED_BUFFER_SIZE}: {err}");
    }
    if let Err(err) = sock.set_send_buffer_size(WANTED_BUFFER_SIZE) {
        warn!("kernel denied send buffer size {WANTED_BUFFER_SIZE}: {err}");
    }

    disable_connreset_on_windows(&sock);

    let std_socket: std::net::UdpSocket = sock.into();
    UdpSocket::from_std(std_socket)
}

/// On Windows, an ICMP port-unreachable from a transient endpoint otherwise
/// poisons subsequent `recv`s on a connectionless socket with
/// `WSAECONNRESET`. Disabling `SIO_UDP_CONNRESET` is a no-op cost on other
/// platforms, so it is only compiled in on Windows (§4.C step 1).
#[cfg(windows)]
fn disable_connreset_on_windows(sock: &Socket) {
    use std::os::windows::io::AsRawSocket;

    const IOC_IN: u32 = 0x8000_0000;
    const IOC_VENDOR: u32 = 0x1800_0000;
    const SIO_UDP_CONNRESET: u32 = IOC_IN | IOC_VENDOR | 12;

    #[link(name = "ws2_32")]
    extern "system" {
        fn WSAIoctl(
            s: usize,
            dw_io_control_code: u32,
            lp_v_in_buffer: *const u32,
            cb_in_buffer: u32,
            lp_v_out_buffer: *mut core::ffi::c_void,
            cb_out_buffer: u32,
            lpcb_bytes_returned: *mut u32,
            lp_overlapped: *mut core::ffi::c_void,
            lp_completion_routine: *mut core::ffi::c_void,
        ) -> i32;
    }

    let enable: u32 = 0;
    let mut bytes_returned: u32 = 0;
    let ret = unsafe {
        WSAIoctl(
            sock.as_raw_socket() as usize,
            SIO_UDP_CONNRESET,
            &enable,
            std::mem::size_of::<u32>() as u32,
            std::ptr::null_mut(),
            0,
            &mut bytes_returned,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if ret != 0 {
        tracing::warn!("failed to disable SIO_UDP_CONNRESET: WSAIoctl returned {ret}");
    }
}

#[cfg(not(windows))]
fn disable_connreset_on_windows(_sock: &Socket) {}
