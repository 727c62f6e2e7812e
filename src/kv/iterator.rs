//! Iterator position
//!
//! A `KvIterator` only remembers the entry it sits on. Every step asks the
//! view for the neighbour of that key, so writes made through the owning
//! transaction between steps are always visible.

use std::ops::Bound;

use crate::error::Result;

use super::{Entry, KvView};

/// Position over a `KvView`
#[derive(Debug, Clone, Default)]
pub struct KvIterator {
    current: Option<Entry>,
}

impl KvIterator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    /// Key under the iterator, empty when invalid
    pub fn key(&self) -> &[u8] {
        self.current.as_ref().map(|(key, _)| key.as_slice()).unwrap_or(&[])
    }

    /// Value under the iterator, empty when invalid
    pub fn value(&self) -> &[u8] {
        self.current.as_ref().map(|(_, value)| value.as_slice()).unwrap_or(&[])
    }

    /// Position at the first key `>= target`
    pub fn seek<V: KvView + ?Sized>(&mut self, view: &V, target: &[u8]) -> Result<()> {
        self.current = view.next_entry(Bound::Included(target))?;
        Ok(())
    }

    /// Position at the last key `< target` (`<= target` when inclusive)
    pub fn seek_before<V: KvView + ?Sized>(
        &mut self,
        view: &V,
        target: &[u8],
        inclusive: bool,
    ) -> Result<()> {
        let bound = if inclusive { Bound::Included(target) } else { Bound::Excluded(target) };
        self.current = view.prev_entry(bound)?;
        Ok(())
    }

    pub fn seek_to_last<V: KvView + ?Sized>(&mut self, view: &V) -> Result<()> {
        self.current = view.prev_entry(Bound::Unbounded)?;
        Ok(())
    }

    pub fn next<V: KvView + ?Sized>(&mut self, view: &V) -> Result<()> {
        if let Some((key, _)) = self.current.take() {
            self.current = view.next_entry(Bound::Excluded(key.as_slice()))?;
        }
        Ok(())
    }

    pub fn prev<V: KvView + ?Sized>(&mut self, view: &V) -> Result<()> {
        if let Some((key, _)) = self.current.take() {
            self.current = view.prev_entry(Bound::Excluded(key.as_slice()))?;
        }
        Ok(())
    }

    /// Re-read the current key, dropping the position if it was removed
    pub fn refresh<V: KvView + ?Sized>(&mut self, view: &V) -> Result<()> {
        if let Some((key, _)) = self.current.take() {
            self.current = view.get(&key)?.map(|value| (key, value));
        }
        Ok(())
    }
}
