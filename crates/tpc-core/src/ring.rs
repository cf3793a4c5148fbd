//! # ring
//!
//! why: map every key deterministically onto a primary and a secondary participant
//! relations: owned by the coordinator in tpc-node, fed by registration messages
//! what: ParticipantInfo, hash_to_u64, ReplicaRing (consistent-hashing lookup)

use std::fmt;
use std::str::FromStr;

use crate::error::KvError;

/// Address book entry for one registered participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    /// Position on the ring; compared as an unsigned 64-bit value.
    pub id: u64,
    pub host: String,
    pub port: u16,
}

impl ParticipantInfo {
    pub fn new(id: u64, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    /// `host:port`, ready for `TcpStream::connect`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ParticipantInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

impl FromStr for ParticipantInfo {
    type Err = KvError;

    /// Parses `"<id>@<host>:<port>"`.
    ///
    /// Negative ids are accepted and reinterpreted as their unsigned bit
    /// pattern, so peers that think in signed 64-bit ids land on the same
    /// ring position.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || KvError::Protocol(format!("malformed registration '{s}'"));

        let (id, rest) = s.trim().split_once('@').ok_or_else(bad)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(bad)?;
        if host.is_empty() {
            return Err(bad());
        }

        let id = match id.parse::<u64>() {
            Ok(id) => id,
            Err(_) => id.parse::<i64>().map_err(|_| bad())? as u64,
        };
        let port = port.parse::<u16>().map_err(|_| bad())?;

        Ok(Self::new(id, host, port))
    }
}

/// 64-bit string hash used for placement.
///
/// Polynomial hash over UTF-16 code units seeded with a large prime, with
/// wrapping arithmetic. It must never change: placement of existing data
/// depends on it.
pub fn hash_to_u64(key: &str) -> u64 {
    let mut h: u64 = 1_125_899_906_842_597;
    for unit in key.encode_utf16() {
        h = h.wrapping_mul(31).wrapping_add(u64::from(unit));
    }
    h
}

/// Outcome of adding a participant to the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    /// The id was already known; its address was updated.
    Replaced,
}

/// Membership ordered by id.
#[derive(Debug, Clone, Default)]
pub struct ReplicaRing {
    members: Vec<ParticipantInfo>,
}

impl ReplicaRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_members(members: impl IntoIterator<Item = ParticipantInfo>) -> Self {
        let mut ring = Self::new();
        for info in members {
            ring.insert(info);
        }
        ring
    }

    /// Adds a participant, replacing the address of an existing id.
    pub fn insert(&mut self, info: ParticipantInfo) -> Registration {
        match self.members.binary_search_by_key(&info.id, |m| m.id) {
            Ok(pos) => {
                self.members[pos] = info;
                Registration::Replaced
            }
            Err(pos) => {
                self.members.insert(pos, info);
                Registration::Added
            }
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[ParticipantInfo] {
        &self.members
    }

    pub fn get(&self, id: u64) -> Option<&ParticipantInfo> {
        self.members
            .binary_search_by_key(&id, |m| m.id)
            .ok()
            .map(|pos| &self.members[pos])
    }

    /// Smallest id strictly greater than `hash`, wrapping to the smallest id.
    pub fn primary_for_hash(&self, hash: u64) -> Option<&ParticipantInfo> {
        self.members
            .iter()
            .find(|m| m.id > hash)
            .or_else(|| self.members.first())
    }

    pub fn find_primary(&self, key: &str) -> Option<&ParticipantInfo> {
        self.primary_for_hash(hash_to_u64(key))
    }

    /// The member after `id` in id order, wrapping to the first.
    pub fn find_successor(&self, id: u64) -> Option<&ParticipantInfo> {
        let pos = match self.members.binary_search_by_key(&id, |m| m.id) {
            Ok(pos) => pos + 1,
            Err(pos) => pos,
        };
        self.members.get(pos).or_else(|| self.members.first())
    }

    /// Primary and secondary for `key`.
    pub fn replicas(&self, key: &str) -> Result<(ParticipantInfo, ParticipantInfo), KvError> {
        if self.members.len() < 2 {
            return Err(KvError::Unavailable(format!(
                "{} participant(s) registered, 2 required",
                self.members.len()
            )));
        }
        let primary = self
            .find_primary(key)
            .cloned()
            .ok_or_else(|| KvError::Unavailable("no participants registered".into()))?;
        let secondary = self
            .find_successor(primary.id)
            .cloned()
            .ok_or_else(|| KvError::Unavailable("no successor".into()))?;
        Ok((primary, secondary))
    }
}
