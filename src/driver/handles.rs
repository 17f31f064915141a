//! Generation-checked handle arena
//!
//! Connections, statements and cursors share one id space. A handle packs
//! a 12-bit slot generation above a 20-bit slot index (plus one, so no
//! handle is ever zero). Releasing a slot bumps its generation, so a stale
//! handle never resolves to the slot's next occupant.

use sqlipc_client::{DriverError, HandleKind};

use crate::error::{DbError, DbResult};
use crate::sqldb::{SharedCursor, SharedDatabase, SharedStatement};

pub type Handle = u32;

/// Identifies the channel session that created an entry
pub type SessionId = u64;

const INDEX_BITS: u32 = 20;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u32 = 0xFFF;

pub struct ConnectionEntry {
    pub owner: SessionId,
    pub db: SharedDatabase,
    pub statements: Vec<Handle>,
}

pub struct StatementEntry {
    pub owner: SessionId,
    pub parent: Handle,
    pub stmt: SharedStatement,
    pub cursors: Vec<Handle>,
}

pub struct CursorEntry {
    pub owner: SessionId,
    pub parent: Handle,
    pub cursor: SharedCursor,
}

pub enum Entry {
    Connection(ConnectionEntry),
    Statement(StatementEntry),
    Cursor(CursorEntry),
}

impl Entry {
    pub fn kind(&self) -> HandleKind {
        match self {
            Entry::Connection(_) => HandleKind::Connection,
            Entry::Statement(_) => HandleKind::Statement,
            Entry::Cursor(_) => HandleKind::Cursor,
        }
    }

    fn owner(&self) -> SessionId {
        match self {
            Entry::Connection(e) => e.owner,
            Entry::Statement(e) => e.owner,
            Entry::Cursor(e) => e.owner,
        }
    }
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Live objects by handle
pub struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

fn not_found(kind: HandleKind, handle: Handle) -> DriverError {
    DriverError::HandleNotFound { kind, handle }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Number of live handles of every kind
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn insert(&mut self, entry: Entry) -> DbResult<Handle> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = self.slots.len() as u32;
                if index >= INDEX_MASK {
                    return Err(DbError::HandleTableFull);
                }
                self.slots.push(Slot {
                    generation: rand::random::<u32>() & GENERATION_MASK,
                    entry: None,
                });
                index
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(entry);
        self.live += 1;
        Ok((slot.generation << INDEX_BITS) | (index + 1))
    }

    fn index_of(&self, handle: Handle) -> Option<usize> {
        let index = (handle & INDEX_MASK) as usize;
        let slot = self.slots.get(index.checked_sub(1)?)?;
        (slot.entry.is_some() && slot.generation == handle >> INDEX_BITS).then_some(index - 1)
    }

    fn entry(&self, handle: Handle) -> Option<&Entry> {
        let index = self.index_of(handle)?;
        self.slots[index].entry.as_ref()
    }

    fn entry_mut(&mut self, handle: Handle) -> Option<&mut Entry> {
        let index = self.index_of(handle)?;
        self.slots[index].entry.as_mut()
    }

    /// Kind of the live entry behind `handle`, whoever owns it
    pub fn kind_of(&self, handle: Handle) -> Option<HandleKind> {
        self.entry(handle).map(Entry::kind)
    }

    pub fn connection(&self, handle: Handle, owner: SessionId) -> Result<&ConnectionEntry, DriverError> {
        match self.entry(handle) {
            Some(Entry::Connection(e)) if e.owner == owner => Ok(e),
            _ => Err(not_found(HandleKind::Connection, handle)),
        }
    }

    pub fn statement(&self, handle: Handle, owner: SessionId) -> Result<&StatementEntry, DriverError> {
        match self.entry(handle) {
            Some(Entry::Statement(e)) if e.owner == owner => Ok(e),
            _ => Err(not_found(HandleKind::Statement, handle)),
        }
    }

    pub fn cursor(&self, handle: Handle, owner: SessionId) -> Result<&CursorEntry, DriverError> {
        match self.entry(handle) {
            Some(Entry::Cursor(e)) if e.owner == owner => Ok(e),
            _ => Err(not_found(HandleKind::Cursor, handle)),
        }
    }

    pub fn insert_connection(&mut self, owner: SessionId, db: SharedDatabase) -> DbResult<Handle> {
        self.insert(Entry::Connection(ConnectionEntry {
            owner,
            db,
            statements: Vec::new(),
        }))
    }

    /// Register a prepared statement, and the cursor its immediate
    /// execution produced, under `connh`
    ///
    /// Either every handle is registered or none is.
    pub fn insert_statement(
        &mut self,
        owner: SessionId,
        connh: Handle,
        stmt: SharedStatement,
        cursor: Option<SharedCursor>,
    ) -> Result<(Handle, Option<Handle>), DriverError> {
        self.connection(connh, owner)?;

        let stmth = self.insert(Entry::Statement(StatementEntry {
            owner,
            parent: connh,
            stmt,
            cursors: Vec::new(),
        }))?;

        let cursh = match cursor {
            Some(cursor) => match self.insert_cursor(owner, stmth, cursor) {
                Ok(cursh) => Some(cursh),
                Err(e) => {
                    self.remove(stmth);
                    return Err(e);
                }
            },
            None => None,
        };

        if let Some(Entry::Connection(conn)) = self.entry_mut(connh) {
            conn.statements.push(stmth);
        }
        Ok((stmth, cursh))
    }

    pub fn insert_cursor(
        &mut self,
        owner: SessionId,
        stmth: Handle,
        cursor: SharedCursor,
    ) -> Result<Handle, DriverError> {
        self.statement(stmth, owner)?;

        let cursh = self.insert(Entry::Cursor(CursorEntry {
            owner,
            parent: stmth,
            cursor,
        }))?;

        if let Some(Entry::Statement(stmt)) = self.entry_mut(stmth) {
            stmt.cursors.push(cursh);
        }
        Ok(cursh)
    }

    fn remove(&mut self, handle: Handle) -> Option<Entry> {
        let index = self.index_of(handle)?;
        let slot = &mut self.slots[index];
        let entry = slot.entry.take()?;
        slot.generation = (slot.generation + 1) & GENERATION_MASK;
        self.free.push(index as u32);
        self.live -= 1;
        Some(entry)
    }

    /// Remove `handle` and everything beneath it, returning the removed
    /// entries children first
    ///
    /// The handle must be of `kind` and belong to `owner`.
    pub fn remove_tree(
        &mut self,
        kind: HandleKind,
        handle: Handle,
        owner: SessionId,
    ) -> Result<Vec<Entry>, DriverError> {
        match self.entry(handle) {
            Some(entry) if entry.kind() == kind && entry.owner() == owner => {}
            _ => return Err(not_found(kind, handle)),
        }

        let mut removed = Vec::new();
        self.detach(handle);
        self.collect_tree(handle, &mut removed);
        Ok(removed)
    }

    fn collect_tree(&mut self, handle: Handle, removed: &mut Vec<Entry>) {
        let Some(entry) = self.remove(handle) else {
            return;
        };
        let children = match &entry {
            Entry::Connection(e) => e.statements.clone(),
            Entry::Statement(e) => e.cursors.clone(),
            Entry::Cursor(_) => Vec::new(),
        };
        for child in children {
            self.collect_tree(child, removed);
        }
        removed.push(entry);
    }

    /// Unlink `handle` from its parent's child list
    fn detach(&mut self, handle: Handle) {
        let parent = match self.entry(handle) {
            Some(Entry::Statement(e)) => e.parent,
            Some(Entry::Cursor(e)) => e.parent,
            _ => return,
        };
        match self.entry_mut(parent) {
            Some(Entry::Connection(e)) => e.statements.retain(|h| *h != handle),
            Some(Entry::Statement(e)) => e.cursors.retain(|h| *h != handle),
            _ => {}
        }
    }

    /// Connection handles opened by `owner`
    pub fn connections_of(&self, owner: SessionId) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.entry {
                Some(Entry::Connection(e)) if e.owner == owner => {
                    Some((slot.generation << INDEX_BITS) | (index as u32 + 1))
                }
                _ => None,
            })
            .collect()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
