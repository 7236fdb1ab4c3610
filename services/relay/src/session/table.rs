//! Dense session table.
//!
//! Ids are small integers reused after removal, so a readiness token can carry
//! the id directly and lookup is a vector index.

use std::convert::Infallible;
use std::fmt;

/// Dense session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(usize);

impl SessionId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Slot vector plus a free list of vacated ids.
#[derive(Debug)]
pub struct SessionTable<T> {
    slots: Vec<Option<T>>,
    vacant: Vec<usize>,
    len: usize,
}

impl<T> Default for SessionTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SessionTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            len: 0,
        }
    }

    /// Insert the value built for the assigned id.
    pub fn insert_with(&mut self, build: impl FnOnce(SessionId) -> T) -> SessionId {
        match self.try_insert_with(|id| Ok::<T, Infallible>(build(id))) {
            Ok(id) => id,
            Err(never) => match never {},
        }
    }

    /// Insert the value built for the assigned id. On error the id stays free.
    pub fn try_insert_with<E>(
        &mut self,
        build: impl FnOnce(SessionId) -> Result<T, E>,
    ) -> Result<SessionId, E> {
        let index = self.vacant.last().copied().unwrap_or(self.slots.len());
        let value = build(SessionId(index))?;

        if index == self.slots.len() {
            self.slots.push(Some(value));
        } else {
            self.vacant.pop();
            self.slots[index] = Some(value);
        }
        self.len += 1;
        Ok(SessionId(index))
    }

    pub fn get(&self, id: SessionId) -> Option<&T> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut T> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<T> {
        let value = self.slots.get_mut(id.0)?.take()?;
        self.vacant.push(id.0);
        self.len -= 1;
        Some(value)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ids of every stored value.
    pub fn ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| SessionId(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_dense_and_reused() {
        let mut table = SessionTable::new();
        let a = table.insert_with(|id| id.index() * 10);
        let b = table.insert_with(|id| id.index() * 10);
        assert_eq!((a.index(), b.index()), (0, 1));
        assert_eq!(table.get(b), Some(&10));

        assert_eq!(table.remove(a), Some(0));
        assert_eq!(table.remove(a), None);
        assert_eq!(table.len(), 1);

        let c = table.insert_with(|_| 99);
        assert_eq!(c, a);
        assert_eq!(table.ids().collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn test_failed_insert_keeps_id_free() {
        let mut table: SessionTable<u8> = SessionTable::new();
        let err = table.try_insert_with(|_| Err::<u8, &str>("no pipe"));
        assert_eq!(err, Err("no pipe"));
        assert!(table.is_empty());

        let id = table.insert_with(|_| 1);
        assert_eq!(id.index(), 0);
        assert!(table.contains(id));
    }

    #[test]
    fn test_lookup_out_of_range() {
        let mut table: SessionTable<u8> = SessionTable::new();
        assert!(table.get(SessionId::new(7)).is_none());
        assert!(table.get_mut(SessionId::new(7)).is_none());
        assert!(table.remove(SessionId::new(7)).is_none());
    }
}
