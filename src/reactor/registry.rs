//! Registry of live connections using slab allocation.
//!
//! Connections are keyed by a generation-counted handle rather than the raw
//! descriptor: when a slot is vacated its generation is bumped, so a stale
//! handle (or a stale readiness event for a recycled slot) misses on lookup
//! instead of aliasing a new connection.

use mio::Token;
use slab::Slab;

/// Opaque handle to a registered connection.
///
/// Packs into a `mio::Token` with the slot index in the low 32 bits and the
/// slot generation in the high 32 bits, so events carry enough information to
/// detect staleness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnId {
    index: u32,
    gen: u32,
}

impl ConnId {
    pub(crate) fn token(self) -> Token {
        Token(((self.gen as usize) << 32) | self.index as usize)
    }

    pub(crate) fn from_token(token: Token) -> Self {
        Self {
            index: token.0 as u32,
            gen: (token.0 >> 32) as u32,
        }
    }
}

struct Entry<C> {
    gen: u32,
    conn: C,
}

/// Owning registry of active connections.
///
/// Provides O(1) insert, lookup, and remove. The reactor is the only mutator;
/// connections are reachable from exactly one slot until removed, at which
/// point ownership moves out to the caller.
pub struct Registry<C> {
    slots: Slab<Entry<C>>,
    gens: Vec<u32>,
    max_connections: usize,
}

impl<C> Registry<C> {
    /// Create a registry with the given connection cap.
    pub fn new(max_connections: usize) -> Self {
        Self {
            slots: Slab::with_capacity(max_connections),
            gens: vec![0; max_connections],
            max_connections,
        }
    }

    /// The handle the next `insert` will return.
    ///
    /// Valid only until the registry is next mutated.
    pub fn vacant_id(&mut self) -> ConnId {
        let index = self.slots.vacant_key();
        if index >= self.gens.len() {
            self.gens.resize(index + 1, 0);
        }
        ConnId {
            index: index as u32,
            gen: self.gens[index],
        }
    }

    /// Insert a connection, returning its handle.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: C) -> Option<ConnId> {
        if self.slots.len() >= self.max_connections {
            return None;
        }
        let id = self.vacant_id();
        let key = self.slots.insert(Entry { gen: id.gen, conn });
        debug_assert_eq!(key, id.index as usize);
        Some(id)
    }

    /// Look up a connection, checking the handle's generation.
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut C> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|e| e.gen == id.gen)
            .map(|e| &mut e.conn)
    }

    /// Whether the handle refers to a live connection.
    pub fn contains(&self, id: ConnId) -> bool {
        self.slots
            .get(id.index as usize)
            .map_or(false, |e| e.gen == id.gen)
    }

    /// Remove a connection, transferring ownership to the caller and
    /// invalidating the handle.
    pub fn remove(&mut self, id: ConnId) -> Option<C> {
        if !self.contains(id) {
            return None;
        }
        let entry = self.slots.remove(id.index as usize);
        self.gens[id.index as usize] = self.gens[id.index as usize].wrapping_add(1);
        Some(entry.conn)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no live connections.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Iterate over all live connections mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConnId, &mut C)> {
        self.slots.iter_mut().map(|(i, e)| {
            (
                ConnId {
                    index: i as u32,
                    gen: e.gen,
                },
                &mut e.conn,
            )
        })
    }
}
