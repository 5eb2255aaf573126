//! Raw HCI socket on Linux
//!
//! Commands are written to a raw `AF_BLUETOOTH` socket bound to one
//! controller. The socket filter passes only Command Complete and Command
//! Status events for the opcode in flight, and reads block on `poll` with a
//! deadline.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use stepcast_core::{DeviceOpenError, HciError, HciTransport, Opcode, RawCommand};
use tracing::{debug, trace};

use crate::hci_packet::{
    encode_command, read_completion, EVT_CMD_COMPLETE, EVT_CMD_STATUS, HCI_EVENT_PKT,
};

const AF_BLUETOOTH: libc::c_int = 31;
const BTPROTO_HCI: libc::c_int = 1;
const SOL_HCI: libc::c_int = 0;
const HCI_FILTER: libc::c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;

#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn command_events(opcode: Opcode) -> Self {
        let mut event_mask = [0u32; 2];
        for event in [EVT_CMD_COMPLETE, EVT_CMD_STATUS] {
            event_mask[(event >> 5) as usize] |= 1 << (event & 31);
        }
        Self {
            type_mask: 1 << HCI_EVENT_PKT,
            event_mask,
            opcode: opcode.to_raw().to_le(),
        }
    }
}

fn poll_timeout_ms(remaining: Duration) -> libc::c_int {
    remaining.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
}

fn last_error() -> String {
    io::Error::last_os_error().to_string()
}

// ----------------------------------------------------------------------------
// HCI Socket
// ----------------------------------------------------------------------------

/// Raw command channel to one controller
#[derive(Debug)]
pub struct HciSocket {
    fd: OwnedFd,
    dev: u16,
    /// Upper bound for a blocking read; callers apply their own shorter
    /// deadline on top
    read_timeout: Duration,
}

impl HciSocket {
    /// Open and bind a raw socket to `hci<dev>`. Needs `CAP_NET_RAW`.
    pub fn open(dev: u16, read_timeout: Duration) -> Result<Self, DeviceOpenError> {
        // SAFETY: plain socket(2) call; the result is checked before use
        let raw = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                BTPROTO_HCI,
            )
        };
        if raw < 0 {
            return Err(DeviceOpenError::HciSocket(last_error()));
        }
        // SAFETY: `raw` is a freshly created descriptor we exclusively own
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: dev,
            hci_channel: HCI_CHANNEL_RAW,
        };
        // SAFETY: `addr` is a valid sockaddr_hci for the duration of the call
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const SockaddrHci as *const libc::sockaddr,
                mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(DeviceOpenError::HciSocket(format!(
                "bind hci{}: {}",
                dev,
                last_error()
            )));
        }

        debug!("Opened raw HCI socket on hci{}", dev);
        Ok(Self {
            fd,
            dev,
            read_timeout,
        })
    }

    fn set_filter(&self, opcode: Opcode) -> Result<(), HciError> {
        let filter = HciFilter::command_events(opcode);
        // SAFETY: `filter` matches the kernel's struct hci_filter layout
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                &filter as *const HciFilter as *const libc::c_void,
                mem::size_of::<HciFilter>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(HciError::TransportError(format!(
                "set HCI filter: {}",
                last_error()
            )));
        }
        Ok(())
    }

    fn write_all(&self, packet: &[u8]) -> Result<(), HciError> {
        // SAFETY: `packet` is valid for `packet.len()` bytes
        let written = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
            )
        };
        if written < 0 || written as usize != packet.len() {
            return Err(HciError::TransportError(format!(
                "write command: {}",
                last_error()
            )));
        }
        Ok(())
    }

    /// Wait until the socket is readable or the deadline passes
    fn wait_readable(&self, deadline: Instant) -> Result<(), HciError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(HciError::Timeout {
                    ms: self.read_timeout.as_millis() as u64,
                });
            }

            let mut pfd = libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            // A negative timeout would make poll wait forever
            let timeout_ms = poll_timeout_ms(remaining);
            // SAFETY: one valid pollfd
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            match rc {
                0 => continue,
                n if n > 0 => return Ok(()),
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(HciError::TransportError(format!("poll: {}", err)));
                    }
                }
            }
        }
    }

    /// Read one event packet, waiting no later than `deadline`
    fn read_event(&self, deadline: Instant, buf: &mut [u8]) -> Result<usize, HciError> {
        loop {
            self.wait_readable(deadline)?;
            // SAFETY: `buf` is valid for `buf.len()` bytes
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(HciError::TransportError(format!("read event: {}", err)));
            }
        }
    }

    /// Send a command and block until its completion event arrives
    pub fn command(&self, command: &RawCommand) -> Result<Vec<u8>, HciError> {
        self.set_filter(command.opcode)?;
        self.write_all(&encode_command(command)?)?;
        trace!(
            "Sent HCI command 0x{:04x} on hci{}",
            command.opcode.to_raw(),
            self.dev
        );

        let deadline = Instant::now() + self.read_timeout;
        read_completion(command.opcode, |buf| self.read_event(deadline, buf))
    }
}

// ----------------------------------------------------------------------------
// Async Command Channel
// ----------------------------------------------------------------------------

/// Shares one socket between async callers, one command at a time
#[derive(Debug, Clone)]
pub(crate) struct SharedHciSocket {
    socket: Arc<Mutex<HciSocket>>,
}

impl SharedHciSocket {
    pub(crate) fn new(socket: HciSocket) -> Self {
        Self {
            socket: Arc::new(Mutex::new(socket)),
        }
    }
}

#[async_trait]
impl HciTransport for SharedHciSocket {
    async fn send_raw_command(&self, command: RawCommand) -> Result<Vec<u8>, HciError> {
        let socket = self.socket.clone();
        tokio::task::spawn_blocking(move || {
            let socket = socket
                .lock()
                .map_err(|_| HciError::TransportError("HCI socket lock poisoned".to_string()))?;
            socket.command(&command)
        })
        .await
        .map_err(|e| HciError::TransportError(format!("HCI worker failed: {}", e)))?
    }
}
