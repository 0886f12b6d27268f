//! String and argument-name-list interning.
//!
//! Interned ids are small stable integers: one counter per kind, assigned on
//! first sight, never reassigned for the lifetime of the process. The maps
//! are append-only; there is no removal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use dashmap::DashMap;

pub struct Interner {
    names: DashMap<String, u32>,
    next_name_id: AtomicU32,
    arg_lists: DashMap<Vec<String>, u32>,
    next_arg_list_id: AtomicU32,
}

/// Immutable point-in-time copy of the interner tables, taken at flush time.
///
/// Interning that happens after the snapshot is taken is simply not part of
/// the snapshot.
#[derive(Debug, Clone, Default)]
pub struct InternerSnapshot {
    pub names: HashMap<String, u32>,
    pub arg_lists: HashMap<Vec<String>, u32>,
}

static GLOBAL: OnceLock<Interner> = OnceLock::new();

impl Interner {
    pub fn new() -> Self {
        Interner {
            names: DashMap::new(),
            next_name_id: AtomicU32::new(0),
            arg_lists: DashMap::new(),
            next_arg_list_id: AtomicU32::new(0),
        }
    }

    /// The process-wide interner, created on first use.
    pub fn global() -> &'static Interner {
        GLOBAL.get_or_init(Interner::new)
    }

    /// Intern a string, returning its stable id.
    ///
    /// Idempotent and safe for unsynchronized concurrent callers.
    pub fn intern(&self, name: &str) -> u32 {
        if let Some(id) = self.names.get(name) {
            return *id;
        }
        *self
            .names
            .entry(name.to_string())
            .or_insert_with(|| self.next_name_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Intern an argument-name list. Lists are compared by value and are
    /// order-sensitive: `["a", "b"]` and `["b", "a"]` get distinct ids.
    pub fn intern_args(&self, arg_names: &[&str]) -> u32 {
        let key: Vec<String> = arg_names.iter().map(|s| s.to_string()).collect();
        if let Some(id) = self.arg_lists.get(&key) {
            return *id;
        }
        *self
            .arg_lists
            .entry(key)
            .or_insert_with(|| self.next_arg_list_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn export(&self) -> InternerSnapshot {
        InternerSnapshot {
            names: self
                .names
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            arg_lists: self
                .arg_lists
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}
