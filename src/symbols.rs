//! Symbol tables produced by model writers and the position maps recovered from them.
use std::hash::Hash;

use ahash::AHashMap;

use crate::error::{Error, Result};
use crate::model::{ConId, Entity, VarId};

/// Maps writer symbols (`v<k>`, `c<k>`, `o<k>`) to the entities they were written for.
#[derive(Clone, Debug, Default)]
pub struct SymbolMap {
    by_symbol: AHashMap<String, Entity>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: impl Into<String>, entity: impl Into<Entity>) {
        self.by_symbol.insert(symbol.into(), entity.into());
    }

    pub fn get(&self, symbol: &str) -> Option<Entity> {
        self.by_symbol.get(symbol).copied()
    }

    pub fn len(&self) -> usize {
        self.by_symbol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Entity)> {
        self.by_symbol.iter().map(|(s, e)| (s.as_str(), *e))
    }

    /// Classify every symbol by its prefix and build the variable and constraint position
    /// maps. Symbols with any other prefix are ignored.
    pub fn position_maps(&self) -> Result<(PositionMap<VarId>, PositionMap<ConId>)> {
        let mut vars = PositionMap::default();
        let mut cons = PositionMap::default();
        for (symbol, entity) in self.iter() {
            let position = || {
                symbol[1..]
                    .parse::<usize>()
                    .map_err(|_| Error::InvalidSymbol(symbol.to_string()))
            };
            match (symbol.as_bytes().first(), entity) {
                (Some(b'v'), Entity::Var(v)) => {
                    vars.insert(v, position()?);
                }
                (Some(b'c'), Entity::Con(c)) => {
                    cons.insert(c, position()?);
                }
                (Some(b'v' | b'c'), _) => return Err(Error::InvalidSymbol(symbol.to_string())),
                _ => {}
            }
        }
        Ok((vars, cons))
    }
}

/// A map from entity identity to a position in the flat index space.
///
/// Valid maps are bijections onto `0..len()`.
#[derive(Clone, Debug)]
pub struct PositionMap<K> {
    positions: AHashMap<K, usize>,
}

impl<K> Default for PositionMap<K> {
    fn default() -> Self {
        Self {
            positions: AHashMap::default(),
        }
    }
}

impl<K: Copy + Eq + Hash> PositionMap<K> {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn get(&self, key: K) -> Option<usize> {
        self.positions.get(&key).copied()
    }

    pub fn contains(&self, key: K) -> bool {
        self.positions.contains_key(&key)
    }

    pub(crate) fn insert(&mut self, key: K, position: usize) -> Option<usize> {
        self.positions.insert(key, position)
    }

    /// Assign `key` the next unused position and return it.
    pub(crate) fn push_next(&mut self, key: K) -> usize {
        let position = self.positions.len();
        self.positions.insert(key, position);
        position
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, usize)> + '_ {
        self.positions.iter().map(|(k, p)| (*k, *p))
    }

    /// Invert the map: the key at output index `i` is the one mapped to position `i`.
    pub fn ordered_keys(&self) -> Result<Vec<K>> {
        let len = self.positions.len();
        let mut slots: Vec<Option<K>> = vec![None; len];
        for (key, position) in self.iter() {
            if let Some(slot) = slots.get_mut(position) {
                *slot = Some(key);
            }
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(missing, slot)| slot.ok_or(Error::IncompletePositionMap { len, missing }))
            .collect()
    }
}
