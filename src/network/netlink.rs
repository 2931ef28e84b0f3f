//! RTNL link message decoding
//!
//! The guest-scoped netlink socket delivers RTM_NEWLINK/RTM_DELLINK
//! multicast notifications. Only the interface name and flags matter for
//! link tracking; everything else in the buffer is skipped. Malformed
//! messages are dropped without an error.

use byteorder::{ByteOrder, NativeEndian, WriteBytesExt};
use tracing::trace;

// Netlink message types
const NLMSG_NOOP: u16 = 1;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;

// Link attributes
const IFLA_IFNAME: u16 = 3;

/// Interface is administratively up
pub const IFF_UP: u32 = 0x1;

const NLMSG_HDRLEN: usize = 16;
const IFINFOMSG_LEN: usize = 16;
const RTA_HDRLEN: usize = 4;

/// Longest interface name the kernel reports, without the NUL
const IFNAME_MAX: usize = 15;

fn align(len: usize) -> usize {
    (len + 3) & !3
}

/// Kind of link notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMessageKind {
    New,
    Del,
}

/// A decoded link notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMessage {
    pub kind: LinkMessageKind,
    pub index: i32,
    pub ifname: String,
    pub flags: u32,
}

impl LinkMessage {
    pub fn new(kind: LinkMessageKind, index: i32, ifname: impl Into<String>, flags: u32) -> Self {
        Self {
            kind,
            index,
            ifname: ifname.into(),
            flags,
        }
    }

    /// Whether the notification reports the link as up
    ///
    /// A removed link is always reported down.
    pub fn is_up(&self) -> bool {
        self.kind == LinkMessageKind::New && self.flags & IFF_UP != 0
    }

    /// Encode as a single netlink message
    ///
    /// Names longer than the kernel limit are cut to fit.
    pub fn encode(&self) -> Vec<u8> {
        let mut end = self.ifname.len().min(IFNAME_MAX);
        while !self.ifname.is_char_boundary(end) {
            end -= 1;
        }
        let ifname = &self.ifname[..end];

        let name_len = ifname.len() + 1;
        let attr_len = RTA_HDRLEN + name_len;
        let total = NLMSG_HDRLEN + IFINFOMSG_LEN + align(attr_len);

        let mut buf = Vec::with_capacity(total);
        let msg_type = match self.kind {
            LinkMessageKind::New => RTM_NEWLINK,
            LinkMessageKind::Del => RTM_DELLINK,
        };

        // Writes into a Vec cannot fail
        let _ = buf.write_u32::<NativeEndian>(total as u32);
        let _ = buf.write_u16::<NativeEndian>(msg_type);
        let _ = buf.write_u16::<NativeEndian>(0);
        let _ = buf.write_u32::<NativeEndian>(0);
        let _ = buf.write_u32::<NativeEndian>(0);

        // ifinfomsg: family, pad, type, index, flags, change
        buf.push(0);
        buf.push(0);
        let _ = buf.write_u16::<NativeEndian>(0);
        let _ = buf.write_i32::<NativeEndian>(self.index);
        let _ = buf.write_u32::<NativeEndian>(self.flags);
        let _ = buf.write_u32::<NativeEndian>(u32::MAX);

        let _ = buf.write_u16::<NativeEndian>(attr_len as u16);
        let _ = buf.write_u16::<NativeEndian>(IFLA_IFNAME);
        buf.extend_from_slice(ifname.as_bytes());
        buf.push(0);
        buf.resize(total, 0);
        buf
    }
}

/// Decode every link notification in a netlink datagram
pub fn parse_link_messages(buf: &[u8]) -> Vec<LinkMessage> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while buf.len() - offset >= NLMSG_HDRLEN {
        let header = &buf[offset..];
        let len = NativeEndian::read_u32(&header[0..4]) as usize;
        let msg_type = NativeEndian::read_u16(&header[4..6]);

        if len < NLMSG_HDRLEN || len > header.len() {
            trace!(len, "Dropping truncated netlink message");
            break;
        }

        let payload = &header[NLMSG_HDRLEN..len];
        match msg_type {
            RTM_NEWLINK | RTM_DELLINK => {
                let kind = if msg_type == RTM_NEWLINK {
                    LinkMessageKind::New
                } else {
                    LinkMessageKind::Del
                };
                if let Some(message) = parse_ifinfo(kind, payload) {
                    messages.push(message);
                }
            }
            NLMSG_DONE | NLMSG_ERROR => break,
            NLMSG_NOOP => {}
            other => trace!(msg_type = other, "Ignoring netlink message"),
        }

        offset += align(len);
        if offset > buf.len() {
            break;
        }
    }

    messages
}

fn parse_ifinfo(kind: LinkMessageKind, payload: &[u8]) -> Option<LinkMessage> {
    if payload.len() < IFINFOMSG_LEN {
        return None;
    }

    let index = NativeEndian::read_i32(&payload[4..8]);
    let flags = NativeEndian::read_u32(&payload[8..12]);
    let ifname = find_ifname(&payload[IFINFOMSG_LEN..])?;

    Some(LinkMessage {
        kind,
        index,
        ifname,
        flags,
    })
}

fn find_ifname(mut attrs: &[u8]) -> Option<String> {
    while attrs.len() >= RTA_HDRLEN {
        let len = NativeEndian::read_u16(&attrs[0..2]) as usize;
        let attr_type = NativeEndian::read_u16(&attrs[2..4]);
        if len < RTA_HDRLEN || len > attrs.len() {
            return None;
        }

        if attr_type == IFLA_IFNAME {
            let value = &attrs[RTA_HDRLEN..len];
            let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
            let name = std::str::from_utf8(&value[..end]).ok()?;
            return (!name.is_empty()).then(|| name.to_string());
        }

        let next = align(len).min(attrs.len());
        attrs = &attrs[next..];
    }
    None
}
