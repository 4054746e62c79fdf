use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::{Seek, SeekFrom, Write};

use bstr::ByteSlice;
use cqdb::{CQDBWriter, CQDB};

use crate::codec::{bounded_capacity, unpack_u32, write_len, write_u32};
use crate::concat_vector::{Component, ConcatVector};
use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"lNSP";
const HEADER_SIZE: usize = 12;
const FAMILY_ENTRY_SIZE: usize = 8;

/// A bidirectional dictionary for mapping between strings and integer IDs
#[derive(Debug, Clone, Default)]
struct Dictionary {
    /// Map from string to ID
    str_to_id: HashMap<String, usize>,
    /// Map from ID to string
    id_to_str: Vec<String>,
}

impl Dictionary {
    fn len(&self) -> usize {
        self.id_to_str.len()
    }

    fn get(&self, s: &str) -> Option<usize> {
        self.str_to_id.get(s).copied()
    }

    fn get_name(&self, id: usize) -> Option<&str> {
        self.id_to_str.get(id).map(String::as_str)
    }

    /// Returns the ID for the string, creating a new entry if it doesn't exist
    fn get_or_insert(&mut self, s: &str) -> usize {
        if let Some(&id) = self.str_to_id.get(s) {
            id
        } else {
            let id = self.id_to_str.len();
            self.str_to_id.insert(s.to_string(), id);
            self.id_to_str.push(s.to_string());
            id
        }
    }

    fn iter(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.id_to_str
            .iter()
            .enumerate()
            .map(|(id, s)| (s.as_str(), id))
    }
}

/// Allocates stable [`ConcatVector`] positions for symbolic features.
///
/// Every feature family gets its own component slot, and every sparse key
/// inside a family gets its own offset. Allocation only ever grows, so vectors
/// built at different times against the same namespace stay comparable.
/// A namespace is an explicit value: build all vectors of one model family
/// against the same instance.
#[derive(Debug, Clone, Default)]
pub struct ConcatVectorNamespace {
    families: Dictionary,
    sparse_keys: Vec<Dictionary>,
}

impl ConcatVectorNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of component slots allocated so far
    pub fn num_families(&self) -> usize {
        self.families.len()
    }

    /// An all-zero vector with one component per allocated family
    pub fn new_vector(&self) -> ConcatVector {
        ConcatVector::new(self.families.len())
    }

    fn ensure_family(&mut self, family: &str) -> usize {
        let slot = self.families.get_or_insert(family);
        if self.sparse_keys.len() <= slot {
            self.sparse_keys.resize_with(slot + 1, Dictionary::default);
        }
        slot
    }

    /// Set `family`/`key` to `value` in `vector`, allocating positions on first use
    pub fn set_sparse_feature(
        &mut self,
        vector: &mut ConcatVector,
        family: &str,
        key: &str,
        value: f64,
    ) {
        let slot = self.ensure_family(family);
        let offset = self.sparse_keys[slot].get_or_insert(key);
        vector.set_sparse_component(slot, offset, value);
    }

    /// Set the whole `family` component of `vector` to dense `values`
    pub fn set_dense_feature(&mut self, vector: &mut ConcatVector, family: &str, values: Vec<f64>) {
        let slot = self.ensure_family(family);
        vector.set_dense_component(slot, values);
    }

    /// Component slot of `family`, if allocated
    pub fn feature_index(&self, family: &str) -> Option<usize> {
        self.families.get(family)
    }

    /// Offset of `key` inside `family`, if allocated
    pub fn sparse_feature_index(&self, family: &str, key: &str) -> Option<usize> {
        let slot = self.families.get(family)?;
        self.sparse_keys.get(slot)?.get(key)
    }

    /// Render the non-zero entries of `vector` by feature name, one per line
    pub fn debug_vector(&self, vector: &ConcatVector) -> String {
        let mut out = String::new();
        for (family, slot) in self.families.iter() {
            let keys = &self.sparse_keys[slot];
            match vector.component(slot) {
                Some(Component::Sparse { index, value }) if *value != 0.0 => {
                    let key = keys
                        .get_name(*index)
                        .map_or_else(|| format!("#{}", index), str::to_string);
                    let _ = writeln!(out, "{}:{} = {}", family, key, value);
                }
                Some(Component::Dense(values)) => {
                    for (offset, value) in values.iter().enumerate() {
                        if *value == 0.0 {
                            continue;
                        }
                        match keys.get_name(offset) {
                            Some(key) => {
                                let _ = writeln!(out, "{}:{} = {}", family, key, value);
                            }
                            None => {
                                let _ = writeln!(out, "{}[{}] = {}", family, offset, value);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Persist the namespace.
    ///
    /// Layout: magic, family count, offset of the family database, then one
    /// (key count, key database offset) pair per family. Offsets are relative
    /// to the start of the namespace; databases are CQDB chunks.
    pub fn write_to<W: Write + Seek>(&self, w: &mut W) -> Result<()> {
        let start = w.stream_position()?;
        let num_families = self.families.len();

        // Placeholder header, patched once the chunk offsets are known
        w.write_all(MAGIC)?;
        write_len(w, num_families, "number of families")?;
        write_u32(w, 0)?;
        for keys in &self.sparse_keys {
            write_len(w, keys.len(), "number of sparse keys")?;
            write_u32(w, 0)?;
        }

        let relative = |pos: u64| -> Result<u32> {
            u32::try_from(pos - start)
                .map_err(|_| Error::invalid_data("namespace position exceeds u32::MAX"))
        };

        let mut off_families = 0;
        if num_families > 0 {
            off_families = relative(w.stream_position()?)?;
            Self::write_cqdb(w, &self.families)?;
        }
        let mut off_keys = vec![0u32; num_families];
        for (slot, keys) in self.sparse_keys.iter().enumerate() {
            if keys.len() > 0 {
                off_keys[slot] = relative(w.stream_position()?)?;
                Self::write_cqdb(w, keys)?;
            }
        }

        let end = w.stream_position()?;
        w.seek(SeekFrom::Start(start + 8))?;
        write_u32(w, off_families)?;
        for (keys, offset) in self.sparse_keys.iter().zip(off_keys) {
            write_len(w, keys.len(), "number of sparse keys")?;
            write_u32(w, offset)?;
        }
        w.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    fn write_cqdb<W: Write + Seek>(w: &mut W, dict: &Dictionary) -> Result<()> {
        let mut writer = CQDBWriter::new(w)?;
        for (s, id) in dict.iter() {
            let id = u32::try_from(id).map_err(|_| Error::invalid_data("id exceeds u32::MAX"))?;
            writer.put(s, id)?;
        }
        // The database is finalized when the writer is dropped
        Ok(())
    }

    /// Load a namespace written by [`write_to`](Self::write_to) from memory
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE || &buf[0..4] != MAGIC {
            return Err(Error::invalid_data(
                "invalid namespace format, magic mismatch",
            ));
        }
        let num_families = unpack_u32(&buf[4..])? as usize;
        let off_families = unpack_u32(&buf[8..])? as usize;

        let families = Self::read_cqdb(buf, off_families, num_families)?;
        let mut sparse_keys = Vec::with_capacity(bounded_capacity(num_families));
        for slot in 0..num_families {
            let index = HEADER_SIZE + slot * FAMILY_ENTRY_SIZE;
            let num_keys = unpack_u32(buf.get(index..).unwrap_or_default())? as usize;
            let offset = unpack_u32(buf.get(index + 4..).unwrap_or_default())? as usize;
            sparse_keys.push(Self::read_cqdb(buf, offset, num_keys)?);
        }
        Ok(Self {
            families,
            sparse_keys,
        })
    }

    fn read_cqdb(buf: &[u8], offset: usize, count: usize) -> Result<Dictionary> {
        let mut dict = Dictionary::default();
        if count == 0 {
            return Ok(dict);
        }
        let chunk = buf
            .get(offset..)
            .ok_or_else(|| Error::invalid_data("database offset out of range"))?;
        let db = CQDB::new(chunk)?;
        for id in 0..count {
            let name = u32::try_from(id)
                .ok()
                .and_then(|id| db.to_str(id))
                .and_then(|s| s.to_str().ok())
                .ok_or_else(|| Error::invalid_data(format!("missing name for id {}", id)))?;
            dict.get_or_insert(name);
        }
        Ok(dict)
    }
}
