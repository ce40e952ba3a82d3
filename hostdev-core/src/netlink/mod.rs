//! Process exit notifications from the kernel's proc connector.
//!
//! The connector is a netlink socket (`NETLINK_CONNECTOR`) joined to the
//! `CN_IDX_PROC` multicast group. After a `PROC_CN_MCAST_LISTEN` control
//! message the kernel multicasts one `proc_event` per fork/exec/exit.
//!
//! ```text
//! nlmsghdr (16) | cn_msg (20) | proc_event header (16) | exit_proc_event
//!                                what, cpu, timestamp    pid, tgid, code, signal
//! ```

mod cleaner;

pub use cleaner::ExitCleaner;

use crate::error::{HostdevError, Result};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

const NLMSG_HDRLEN: usize = 16;
const NLMSG_DONE: u16 = 3;
const CN_MSG_LEN: usize = 20;
const PROC_EVENT_HEADER_LEN: usize = 16;

const CN_IDX_PROC: u32 = 1;
const CN_VAL_PROC: u32 = 1;

/// Control operations understood by the proc connector.
pub const PROC_CN_MCAST_LISTEN: u32 = 1;
pub const PROC_CN_MCAST_IGNORE: u32 = 2;

const PROC_EVENT_EXIT: u32 = 0x8000_0000;

const RECV_BUFFER_SIZE: usize = 4096;

/// Subscription to process exit events.
///
/// Dropping the monitor unsubscribes and closes the socket.
pub struct ProcessMonitor {
    fd: AsyncFd<OwnedFd>,
}

impl ProcessMonitor {
    /// Open the connector socket and start listening. Needs CAP_NET_ADMIN.
    pub fn open() -> Result<Self> {
        // SAFETY: plain socket(2) call; the result is checked before use.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::NETLINK_CONNECTOR,
            )
        };
        if raw < 0 {
            return Err(netlink_error("failed to create netlink socket", io::Error::last_os_error()));
        }
        // SAFETY: raw is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let addr = netlink_addr(CN_IDX_PROC);
        // SAFETY: addr is a valid sockaddr_nl and the length matches it.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(netlink_error("failed to bind netlink socket", io::Error::last_os_error()));
        }

        send_control(fd.as_raw_fd(), PROC_CN_MCAST_LISTEN)
            .map_err(|e| netlink_error("failed to subscribe to process events", e))?;

        let fd = AsyncFd::try_new(fd)
            .map_err(|e| netlink_error("failed to register socket", e.into_parts().1))?;
        debug!("Subscribed to process events");
        Ok(Self { fd })
    }

    /// Wait for the next datagram from the kernel and return the thread
    /// group ids of the processes that exited.
    ///
    /// Datagrams from other senders are skipped.
    pub async fn next_exits(&self) -> Result<Vec<u32>> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let mut guard = self
                .fd
                .readable()
                .await
                .map_err(|e| netlink_error("failed to poll netlink socket", e))?;

            match guard.try_io(|inner| recv_from_kernel(inner.get_ref().as_raw_fd(), &mut buf)) {
                Ok(Ok(Some(len))) => return Ok(parse_exit_events(&buf[..len])),
                Ok(Ok(None)) => debug!("Ignoring netlink message not sent by the kernel"),
                Ok(Err(e)) => return Err(netlink_error("failed to read netlink socket", e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        if let Err(e) = send_control(self.fd.get_ref().as_raw_fd(), PROC_CN_MCAST_IGNORE) {
            warn!("Failed to unsubscribe from process events: {}", e);
        }
    }
}

/// Build a proc connector control message carrying `op`.
pub fn encode_control_message(op: u32, pid: u32) -> Vec<u8> {
    let payload_len = mem::size_of::<u32>();
    let total = NLMSG_HDRLEN + CN_MSG_LEN + payload_len;
    let mut buf = Vec::with_capacity(total);

    // nlmsghdr
    buf.extend_from_slice(&(total as u32).to_ne_bytes());
    buf.extend_from_slice(&NLMSG_DONE.to_ne_bytes());
    buf.extend_from_slice(&0u16.to_ne_bytes()); // flags
    buf.extend_from_slice(&1u32.to_ne_bytes()); // seq
    buf.extend_from_slice(&pid.to_ne_bytes());

    // cn_msg
    buf.extend_from_slice(&CN_IDX_PROC.to_ne_bytes());
    buf.extend_from_slice(&CN_VAL_PROC.to_ne_bytes());
    buf.extend_from_slice(&1u32.to_ne_bytes()); // seq
    buf.extend_from_slice(&0u32.to_ne_bytes()); // ack
    buf.extend_from_slice(&(payload_len as u16).to_ne_bytes());
    buf.extend_from_slice(&0u16.to_ne_bytes()); // flags

    buf.extend_from_slice(&op.to_ne_bytes());
    buf
}

/// Extract the pid of every process (thread group leader) exit in a
/// datagram.
///
/// Truncated or foreign messages are skipped.
pub fn parse_exit_events(buf: &[u8]) -> Vec<u32> {
    let mut pids = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= buf.len() {
        let msg_len = read_u32(buf, offset) as usize;
        if msg_len < NLMSG_HDRLEN || offset + msg_len > buf.len() {
            break;
        }
        let msg_type = u16::from_ne_bytes([buf[offset + 4], buf[offset + 5]]);

        if msg_type == NLMSG_DONE {
            let payload = &buf[offset + NLMSG_HDRLEN..offset + msg_len];
            if let Some(tgid) = exit_tgid(payload) {
                pids.push(tgid);
            }
        }

        // NLMSG_ALIGN
        offset += (msg_len + 3) & !3;
    }

    pids
}

fn exit_tgid(payload: &[u8]) -> Option<u32> {
    let event = CN_MSG_LEN;
    let data = event + PROC_EVENT_HEADER_LEN;
    // exit_proc_event: process_pid, process_tgid, exit_code, exit_signal
    if payload.len() < data + 16 || read_u32(payload, event) != PROC_EVENT_EXIT {
        return None;
    }
    let pid = read_u32(payload, data);
    let tgid = read_u32(payload, data + 4);
    // Every thread reports its own exit; only the leader ends the process.
    (pid == tgid).then_some(tgid)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn netlink_addr(groups: u32) -> libc::sockaddr_nl {
    // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = groups;
    addr
}

fn send_control(fd: RawFd, op: u32) -> io::Result<()> {
    let msg = encode_control_message(op, std::process::id());
    let dest = netlink_addr(CN_IDX_PROC);
    // SAFETY: msg and dest outlive the call and lengths match the buffers.
    let rc = unsafe {
        libc::sendto(
            fd,
            msg.as_ptr() as *const libc::c_void,
            msg.len(),
            0,
            &dest as *const libc::sockaddr_nl as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receive one datagram. `None` when the sender was not the kernel.
fn recv_from_kernel(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let mut from = netlink_addr(0);
    let mut from_len = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
    // SAFETY: buf and from are valid for writes of the given lengths.
    let rc = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut from as *mut libc::sockaddr_nl as *mut libc::sockaddr,
            &mut from_len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if from.nl_pid != 0 {
        return Ok(None);
    }
    Ok(Some(rc as usize))
}

fn netlink_error(context: &str, e: io::Error) -> HostdevError {
    HostdevError::NetlinkError { reason: format!("{}: {}", context, e) }
}
