//! Raw L2CAP socket backend for plant sensor connections.
//!
//! This backend opens an LE connection on the ATT fixed channel directly
//! through the kernel, without the BlueZ daemon, and speaks the handful of
//! ATT requests the sensor needs. Characteristics are addressed by their
//! attribute handles. It requires CAP_NET_RAW and CAP_NET_ADMIN capabilities
//! or root privileges, and uses the kernel's default adapter.

use super::{Characteristic, DeviceLink, LinkError, Session};
use crate::mac_address::MacAddress;
use futures::FutureExt;
use futures::future::BoxFuture;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_SEQPACKET, c_int, c_void, sockaddr, socklen_t};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::sync::Mutex;
use tracing::debug;

// L2CAP protocol constants
const BTPROTO_L2CAP: c_int = 0;
const ATT_CID: u16 = 0x0004;
const BDADDR_LE_PUBLIC: u8 = 0x01;

// ATT opcodes
const ATT_OP_ERROR_RSP: u8 = 0x01;
const ATT_OP_READ_REQ: u8 = 0x0A;
const ATT_OP_READ_RSP: u8 = 0x0B;
const ATT_OP_WRITE_REQ: u8 = 0x12;
const ATT_OP_WRITE_RSP: u8 = 0x13;
const ATT_OP_HANDLE_NFY: u8 = 0x1B;
const ATT_OP_HANDLE_IND: u8 = 0x1D;
const ATT_OP_HANDLE_CNF: u8 = 0x1E;
const ATT_OP_WRITE_CMD: u8 = 0x52;

/// Large enough for any ATT PDU (maximum attribute value is 512 bytes).
const ATT_MAX_PDU: usize = 517;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// L2CAP socket address structure
#[repr(C)]
struct SockaddrL2 {
    l2_family: libc::sa_family_t,
    l2_psm: u16,
    l2_bdaddr: [u8; 6],
    l2_cid: u16,
    l2_bdaddr_type: u8,
}

impl SockaddrL2 {
    fn att(bdaddr: [u8; 6]) -> Self {
        Self {
            l2_family: AF_BLUETOOTH as libc::sa_family_t,
            l2_psm: 0,
            l2_bdaddr: bdaddr,
            l2_cid: ATT_CID.to_le(),
            l2_bdaddr_type: BDADDR_LE_PUBLIC,
        }
    }
}

/// Build a Read Request for `handle`.
fn read_request(handle: u16) -> Vec<u8> {
    let [lo, hi] = handle.to_le_bytes();
    vec![ATT_OP_READ_REQ, lo, hi]
}

/// Build a Write Request (acknowledged) or Write Command for `handle`.
fn write_request(handle: u16, value: &[u8], wait_for_ack: bool) -> Vec<u8> {
    let opcode = if wait_for_ack {
        ATT_OP_WRITE_REQ
    } else {
        ATT_OP_WRITE_CMD
    };
    let [lo, hi] = handle.to_le_bytes();
    let mut pdu = Vec::with_capacity(3 + value.len());
    pdu.push(opcode);
    pdu.push(lo);
    pdu.push(hi);
    pdu.extend_from_slice(value);
    pdu
}

/// A PDU received while waiting for the answer to a request.
#[derive(Debug, PartialEq)]
enum Incoming {
    /// The response to our request, with its payload
    Response(Vec<u8>),
    /// An indication that must be confirmed before reading on
    Indication,
    /// Anything else (notifications, unrelated PDUs)
    Unsolicited,
}

fn response_opcode(request_opcode: u8) -> Option<u8> {
    match request_opcode {
        ATT_OP_READ_REQ => Some(ATT_OP_READ_RSP),
        ATT_OP_WRITE_REQ => Some(ATT_OP_WRITE_RSP),
        _ => None,
    }
}

/// Classify a received PDU relative to the outstanding request.
fn parse_incoming(request_opcode: u8, pdu: &[u8]) -> Result<Incoming, LinkError> {
    let Some((&opcode, payload)) = pdu.split_first() else {
        return Ok(Incoming::Unsolicited);
    };

    match opcode {
        ATT_OP_ERROR_RSP if payload.first() == Some(&request_opcode) => {
            let handle = match payload {
                [_, lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
                _ => 0,
            };
            let code = payload.get(3).copied().unwrap_or(0);
            Err(LinkError::Transport(format!(
                "ATT error 0x{code:02x} on handle 0x{handle:04x}"
            )))
        }
        ATT_OP_HANDLE_IND => Ok(Incoming::Indication),
        ATT_OP_HANDLE_NFY => Ok(Incoming::Unsolicited),
        op if Some(op) == response_opcode(request_opcode) => {
            Ok(Incoming::Response(payload.to_vec()))
        }
        _ => Ok(Incoming::Unsolicited),
    }
}

fn transport_error(err: io::Error) -> LinkError {
    LinkError::Transport(err.to_string())
}

/// Open a non-blocking L2CAP socket
fn open_l2cap_socket() -> Result<OwnedFd, LinkError> {
    // SOCK_NONBLOCK is required for AsyncFd to work properly
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_SEQPACKET | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_L2CAP,
        )
    };

    if fd < 0 {
        return Err(LinkError::Backend(format!(
            "Failed to create L2CAP socket: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind the socket to any local adapter on the ATT channel
fn bind_l2cap_socket(fd: &OwnedFd) -> Result<(), LinkError> {
    let addr = SockaddrL2::att([0; 6]);

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrL2 as *const sockaddr,
            mem::size_of::<SockaddrL2>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(LinkError::Backend(format!(
            "Failed to bind L2CAP socket: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Start a non-blocking connect; completion is signalled by writability.
fn start_connect(fd: &OwnedFd, address: MacAddress) -> Result<(), LinkError> {
    let addr = SockaddrL2::att(address.to_le_bytes());

    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const SockaddrL2 as *const sockaddr,
            mem::size_of::<SockaddrL2>() as socklen_t,
        )
    };

    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(LinkError::Unreachable(address, err.to_string()));
        }
    }

    Ok(())
}

/// Read the pending socket error after a non-blocking connect.
fn take_socket_error(fd: &AsyncFd<OwnedFd>) -> io::Result<()> {
    let mut error: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut c_int as *mut c_void,
            &mut len,
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if error != 0 {
        return Err(io::Error::from_raw_os_error(error));
    }
    Ok(())
}

/// Device link over raw L2CAP sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct L2capLink;

impl L2capLink {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceLink for L2capLink {
    fn connect(&self, address: MacAddress) -> BoxFuture<'_, Result<Box<dyn Session>, LinkError>> {
        async move {
            let session = L2capSession::connect(address).await?;
            Ok(Box::new(session) as Box<dyn Session>)
        }
        .boxed()
    }
}

/// An ATT bearer to one device.
struct L2capSession {
    fd: AsyncFd<OwnedFd>,
    // one outstanding request at a time, as ATT requires
    transaction: Mutex<()>,
}

impl L2capSession {
    async fn connect(address: MacAddress) -> Result<Self, LinkError> {
        let fd = open_l2cap_socket()?;
        bind_l2cap_socket(&fd)?;
        start_connect(&fd, address)?;

        let fd = AsyncFd::new(fd)
            .map_err(|e| LinkError::Backend(format!("Failed to create async fd: {}", e)))?;

        match tokio::time::timeout(CONNECT_TIMEOUT, fd.writable()).await {
            Ok(Ok(_guard)) => {}
            Ok(Err(err)) => return Err(LinkError::Unreachable(address, err.to_string())),
            Err(_) => {
                return Err(LinkError::Unreachable(
                    address,
                    "connection timed out".to_string(),
                ));
            }
        }
        take_socket_error(&fd).map_err(|e| LinkError::Unreachable(address, e.to_string()))?;
        debug!("connected to device {} over L2CAP", address);

        Ok(Self {
            fd,
            transaction: Mutex::new(()),
        })
    }

    async fn send(&self, pdu: &[u8]) -> Result<(), LinkError> {
        loop {
            let mut guard = self.fd.writable().await.map_err(transport_error)?;
            match guard.try_io(|inner| {
                let ret = unsafe {
                    libc::write(inner.as_raw_fd(), pdu.as_ptr() as *const c_void, pdu.len())
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            }) {
                Ok(result) => return result.map_err(transport_error),
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        loop {
            let mut guard = self.fd.readable().await.map_err(transport_error)?;
            match guard.try_io(|inner| {
                let ret = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut c_void,
                        buf.len(),
                    )
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            }) {
                Ok(Ok(0)) => {
                    return Err(LinkError::Transport(
                        "connection closed by device".to_string(),
                    ));
                }
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(err)) => return Err(transport_error(err)),
                Err(_would_block) => continue,
            }
        }
    }

    /// Send `request` and, unless it is a command, wait for its response.
    async fn transact(&self, request: &[u8]) -> Result<Vec<u8>, LinkError> {
        let _lock = self.transaction.lock().await;
        self.send(request).await?;

        let opcode = request[0];
        if response_opcode(opcode).is_none() {
            return Ok(Vec::new());
        }

        let wait = async {
            let mut buf = [0u8; ATT_MAX_PDU];
            loop {
                let n = self.recv(&mut buf).await?;
                match parse_incoming(opcode, &buf[..n])? {
                    Incoming::Response(payload) => return Ok(payload),
                    Incoming::Indication => self.send(&[ATT_OP_HANDLE_CNF]).await?,
                    Incoming::Unsolicited => {}
                }
            }
        };

        tokio::time::timeout(RESPONSE_TIMEOUT, wait)
            .await
            .map_err(|_| LinkError::Transport("timed out waiting for ATT response".to_string()))?
    }
}

impl Session for L2capSession {
    fn read(&self, characteristic: Characteristic) -> BoxFuture<'_, Result<Vec<u8>, LinkError>> {
        async move { self.transact(&read_request(characteristic.handle())).await }.boxed()
    }

    fn write<'a>(
        &'a self,
        characteristic: Characteristic,
        value: &'a [u8],
        wait_for_ack: bool,
    ) -> BoxFuture<'a, Result<(), LinkError>> {
        async move {
            let pdu = write_request(characteristic.handle(), value, wait_for_ack);
            self.transact(&pdu).await.map(|_| ())
        }
        .boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), LinkError>> {
        async move {
            let ret = unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR) };
            if ret < 0 {
                return Err(transport_error(io::Error::last_os_error()));
            }
            Ok(())
        }
        .boxed()
    }
}
