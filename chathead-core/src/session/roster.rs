//! Server-side table of connected clients.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RosterEntry {
    pub addr: SocketAddr,
    pub last_seen: Instant,
}

/// Result of a Hello from `addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// `addr` holds `player_id`; `new` is false for a repeated Hello.
    Assigned { player_id: u32, new: bool },
    /// Every id in `1..max_players` is taken.
    Full,
}

/// Player ids and addresses of the clients the server accepted.
#[derive(Debug)]
pub struct Roster {
    max_players: u32,
    players: BTreeMap<u32, RosterEntry>,
    by_addr: HashMap<SocketAddr, u32>,
}

impl Roster {
    pub fn new(max_players: u32) -> Self {
        Self {
            max_players,
            players: BTreeMap::new(),
            by_addr: HashMap::new(),
        }
    }

    /// Assign the lowest free id to `addr`, or return the id it already
    /// holds.
    pub fn admit(&mut self, addr: SocketAddr, now: Instant) -> Admission {
        if let Some(&player_id) = self.by_addr.get(&addr) {
            self.touch(addr, now);
            return Admission::Assigned {
                player_id,
                new: false,
            };
        }
        let Some(player_id) = (1..self.max_players).find(|id| !self.players.contains_key(id)) else {
            return Admission::Full;
        };
        self.players.insert(player_id, RosterEntry { addr, last_seen: now });
        self.by_addr.insert(addr, player_id);
        Admission::Assigned {
            player_id,
            new: true,
        }
    }

    pub fn id_of(&self, addr: &SocketAddr) -> Option<u32> {
        self.by_addr.get(addr).copied()
    }

    pub fn touch(&mut self, addr: SocketAddr, now: Instant) {
        if let Some(entry) = self.by_addr.get(&addr).and_then(|id| self.players.get_mut(id)) {
            entry.last_seen = now;
        }
    }

    pub fn remove(&mut self, player_id: u32) -> Option<RosterEntry> {
        let entry = self.players.remove(&player_id)?;
        self.by_addr.remove(&entry.addr);
        Some(entry)
    }

    /// Ids silent for longer than `timeout`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<u32> {
        self.players
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) > timeout)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Every connected client address.
    pub fn addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.players.values().map(|e| e.addr)
    }

    /// Every connected client address except `player_id`'s.
    pub fn addrs_except(&self, player_id: u32) -> impl Iterator<Item = SocketAddr> + '_ {
        self.players
            .iter()
            .filter(move |(id, _)| **id != player_id)
            .map(|(_, e)| e.addr)
    }

    /// Connected client ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.players.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn clear(&mut self) {
        self.players.clear();
        self.by_addr.clear();
    }
}
