//! Domain key table — bidirectional map between domains and the values
//! embedded in outgoing probes.
//!
//! A TLS probe carries a domain in the SNI field, but middleboxes answer
//! with bare TCP resets. To tie a reset back to the domain that triggered
//! it, each domain is assigned a unique identifying value (typically the
//! source port) before probing starts. The table supports O(1) lookups in
//! both directions and is safe to share across worker tasks.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;

use crate::SharedRng;

/// Value generator invoked by [`KeyTable::try_insert_generate`].
pub type Generator<V> = Box<dyn Fn(&str) -> V + Send + Sync>;

/// Error from key-table operations.
#[derive(Debug, thiserror::Error)]
pub enum KeyTableError {
    #[error("no generate function provided")]
    NoGenerator,

    #[error("marshal failed: {0}")]
    Marshal(#[from] serde_json::Error),

    #[error("marshal write failed: {0}")]
    Io(#[from] std::io::Error),
}

struct Inner<V> {
    fwd: HashMap<String, V>,
    rev: HashMap<V, String>,
}

/// Mutex-protected pair of maps `domain -> value` and `value -> domain`.
///
/// Both maps are kept in one-to-one correspondence as long as values are
/// only created through [`KeyTable::try_insert_generate`]; see the warning
/// on [`KeyTable::insert`].
pub struct KeyTable<V> {
    inner: Mutex<Inner<V>>,
    generate: Option<Generator<V>>,
}

impl<V: Copy + Eq + Hash> KeyTable<V> {
    /// Create an empty table with no generator configured.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                fwd: HashMap::new(),
                rev: HashMap::new(),
            }),
            generate: None,
        }
    }

    /// Create an empty table with a value generator.
    pub fn with_generator(generate: Generator<V>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                fwd: HashMap::new(),
                rev: HashMap::new(),
            }),
            generate: Some(generate),
        }
    }

    /// Forward lookup: the value assigned to `domain`, if any.
    pub fn get(&self, domain: &str) -> Option<V> {
        let inner = self.inner.lock().expect("key table poisoned");
        inner.fwd.get(domain).copied()
    }

    /// Reverse lookup: the domain a value was assigned to, if any.
    pub fn get_key(&self, value: V) -> Option<String> {
        let inner = self.inner.lock().expect("key table poisoned");
        inner.rev.get(&value).cloned()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("key table poisoned").fwd.len()
    }

    /// True when the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert unconditionally into both maps.
    ///
    /// Warning: overwrites any existing forward entry without removing the
    /// old reverse entry, so misuse can break the bijection. Prefer
    /// [`KeyTable::try_insert_generate`] unless the caller guarantees
    /// distinct values (e.g. the stepped population mode).
    pub fn insert(&self, domain: &str, value: V) {
        let mut inner = self.inner.lock().expect("key table poisoned");
        inner.fwd.insert(domain.to_string(), value);
        inner.rev.insert(value, domain.to_string());
    }

    /// Return the existing value for `domain`, or generate a fresh one.
    ///
    /// The generator is called repeatedly until it produces a value not yet
    /// present in the reverse map; collisions merely cause a retry.
    ///
    /// # Errors
    /// [`KeyTableError::NoGenerator`] when no generator was configured.
    pub fn try_insert_generate(&self, domain: &str) -> Result<V, KeyTableError> {
        let generate = self.generate.as_ref().ok_or(KeyTableError::NoGenerator)?;

        let mut inner = self.inner.lock().expect("key table poisoned");
        if let Some(v) = inner.fwd.get(domain) {
            return Ok(*v);
        }

        let value = loop {
            let v = generate(domain);
            if !inner.rev.contains_key(&v) {
                break v;
            }
        };
        inner.fwd.insert(domain.to_string(), value);
        inner.rev.insert(value, domain.to_string());
        Ok(value)
    }
}

impl<V: Copy + Eq + Hash + Display + Serialize> KeyTable<V> {
    /// Write the table as JSON: `{"fwd": {...}, "rev": {...}}`.
    ///
    /// Reverse-map keys become JSON object keys, so only integer-like value
    /// types are supported here.
    pub fn marshal<W: Write>(&self, mut w: W) -> Result<(), KeyTableError> {
        #[derive(Serialize)]
        struct Dump<'a, V> {
            fwd: &'a HashMap<String, V>,
            rev: HashMap<String, &'a str>,
        }

        let inner = self.inner.lock().expect("key table poisoned");
        let rev = inner
            .rev
            .iter()
            .map(|(v, d)| (v.to_string(), d.as_str()))
            .collect();
        let dump = Dump {
            fwd: &inner.fwd,
            rev,
        };
        let buf = serde_json::to_vec(&dump)?;
        w.write_all(&buf)?;
        Ok(())
    }
}

impl<V: Copy + Eq + Hash> Default for KeyTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Population helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Build a key table assigning each domain a random source port in
/// `[1000, 65535]`, guaranteed unique per domain.
pub fn domain_key_table(domains: &[String], rng: &SharedRng) -> Result<KeyTable<u16>, KeyTableError> {
    let rng = rng.clone();
    let table = KeyTable::with_generator(Box::new(move |_| crate::random_source_port(&rng)));
    for d in domains {
        table.try_insert_generate(d)?;
    }
    Ok(table)
}

/// Build a key table assigning deterministic stepped ports `1001 + i*16`.
///
/// The 16-port spacing wraps the u16 space past 4095 domains and then
/// collides; use [`domain_key_table`] above a few thousand domains.
pub fn stepped_domain_key_table(domains: &[String]) -> KeyTable<u16> {
    let table = KeyTable::new();
    for (i, d) in domains.iter().enumerate() {
        table.insert(d, 1001u16.wrapping_add((i as u16).wrapping_mul(16)));
    }
    table
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
