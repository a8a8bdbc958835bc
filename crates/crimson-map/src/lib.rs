//! Crimson Map - static cluster membership
//!
//! An `OsdMap` names the OSDs of a cluster and their addresses. It is
//! persisted as a packed little-endian image rewritten whole on every
//! mutation; entries stay sorted by id and every successful mutation bumps
//! the epoch by one.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::path::Path;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MapError>;

/// Errors from map edits and the file codec
#[derive(Debug, Error)]
pub enum MapError {
    #[error("osd {0} already exists")]
    OsdExists(u32),

    #[error("no osd {0}")]
    NoSuchOsd(u32),

    #[error("address {0} already present")]
    DuplicateAddress(String),

    #[error("no {kind} address {name}")]
    NoSuchAddress { kind: AddressKind, name: String },

    #[error("malformed map: {0}")]
    InvalidFormat(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport of an OSD address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressKind {
    Rdma = 0,
    Ip = 1,
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rdma => write!(f, "rdma"),
            Self::Ip => write!(f, "ip"),
        }
    }
}

/// A single OSD address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub kind: AddressKind,
    pub name: String,
}

impl Address {
    #[must_use]
    pub fn rdma(name: impl Into<String>) -> Self {
        Self {
            kind: AddressKind::Rdma,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn ip(name: impl Into<String>) -> Self {
        Self {
            kind: AddressKind::Ip,
            name: name.into(),
        }
    }
}

/// One OSD's map entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OsdEntry {
    pub id: u32,
    pub addresses: Vec<Address>,
}

/// The cluster membership map
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OsdMap {
    pub epoch: u32,
    pub entries: Vec<OsdEntry>,
}

impl OsdMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Find an entry by id
    #[must_use]
    pub fn entry(&self, id: u32) -> Option<&OsdEntry> {
        self.entries
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|index| &self.entries[index])
    }

    /// Insert a new OSD in sorted position
    pub fn add_osd(&mut self, id: u32, addresses: Vec<Address>) -> Result<()> {
        match self.entries.binary_search_by_key(&id, |e| e.id) {
            Ok(_) => Err(MapError::OsdExists(id)),
            Err(index) => {
                self.entries.insert(index, OsdEntry { id, addresses });
                self.epoch += 1;
                Ok(())
            }
        }
    }

    /// Remove an OSD by id
    pub fn remove_osd(&mut self, id: u32) -> Result<()> {
        match self.entries.binary_search_by_key(&id, |e| e.id) {
            Ok(index) => {
                self.entries.remove(index);
                self.epoch += 1;
                Ok(())
            }
            Err(_) => Err(MapError::NoSuchOsd(id)),
        }
    }

    /// Append addresses to an existing OSD, rejecting duplicate names
    pub fn add_addrs(&mut self, id: u32, addresses: Vec<Address>) -> Result<()> {
        let index = self
            .entries
            .binary_search_by_key(&id, |e| e.id)
            .map_err(|_| MapError::NoSuchOsd(id))?;
        {
            let existing = &self.entries[index].addresses;
            for addr in &addresses {
                if existing.iter().any(|a| a.name == addr.name) {
                    return Err(MapError::DuplicateAddress(addr.name.clone()));
                }
            }
        }
        self.entries[index].addresses.extend(addresses);
        self.epoch += 1;
        Ok(())
    }

    /// Remove addresses from an existing OSD, rejecting absent ones
    pub fn remove_addrs(&mut self, id: u32, addresses: Vec<Address>) -> Result<()> {
        let index = self
            .entries
            .binary_search_by_key(&id, |e| e.id)
            .map_err(|_| MapError::NoSuchOsd(id))?;

        let existing = &self.entries[index].addresses;
        let mut doomed = Vec::with_capacity(addresses.len());
        for addr in &addresses {
            let found = existing
                .iter()
                .position(|a| a.kind == addr.kind && a.name == addr.name)
                .ok_or_else(|| MapError::NoSuchAddress {
                    kind: addr.kind,
                    name: addr.name.clone(),
                })?;
            doomed.push(found);
        }

        doomed.sort_unstable();
        let addrs = &mut self.entries[index].addresses;
        for found in doomed.into_iter().rev() {
            addrs.remove(found);
        }
        self.epoch += 1;
        Ok(())
    }

    /// Encode the packed image
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_le(self.epoch);
        buf.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            buf.put_u32_le(entry.id);
            buf.put_u32_le(entry.addresses.len() as u32);
            for addr in &entry.addresses {
                buf.put_u8(addr.kind as u8);
                buf.put_u32_le(addr.name.len() as u32);
                buf.put_slice(addr.name.as_bytes());
            }
        }
        buf.to_vec()
    }

    /// Decode a packed image
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        fn need(data: &[u8], len: usize) -> Result<()> {
            if data.remaining() < len {
                return Err(MapError::InvalidFormat(format!(
                    "truncated: need {len} bytes, have {}",
                    data.remaining()
                )));
            }
            Ok(())
        }

        need(data, 8)?;
        let epoch = data.get_u32_le();
        let entry_count = data.get_u32_le() as usize;

        let mut entries = Vec::with_capacity(entry_count.min(1024));
        let mut last_id = None;
        for _ in 0..entry_count {
            need(data, 8)?;
            let id = data.get_u32_le();
            if last_id.is_some_and(|last| last >= id) {
                return Err(MapError::InvalidFormat(format!(
                    "entries not sorted at osd {id}"
                )));
            }
            last_id = Some(id);

            let addr_count = data.get_u32_le() as usize;
            let mut addresses = Vec::with_capacity(addr_count.min(1024));
            for _ in 0..addr_count {
                need(data, 5)?;
                let kind = match data.get_u8() {
                    0 => AddressKind::Rdma,
                    1 => AddressKind::Ip,
                    k => {
                        return Err(MapError::InvalidFormat(format!(
                            "unknown address type {k}"
                        )))
                    }
                };
                let name_len = data.get_u32_le() as usize;
                need(data, name_len)?;
                let name = String::from_utf8(data[..name_len].to_vec())
                    .map_err(|_| MapError::InvalidFormat("address is not utf-8".into()))?;
                data.advance(name_len);
                addresses.push(Address { kind, name });
            }
            entries.push(OsdEntry { id, addresses });
        }
        Ok(Self { epoch, entries })
    }

    /// Read a map file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::decode(&data)
    }

    /// Rewrite the map file from offset zero
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.encode())?;
        Ok(())
    }
}

impl fmt::Display for OsdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "epoch {}", self.epoch)?;
        for entry in &self.entries {
            write!(f, "osd {}:", entry.id)?;
            if entry.addresses.is_empty() {
                write!(f, " (no addresses)")?;
            }
            for addr in &entry.addresses {
                write!(f, " {}={}", addr.kind, addr.name)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
