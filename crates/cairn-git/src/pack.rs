//! Git pack file format implementation.
//!
//! Pack files are the format used by git for efficient object transfer.
//! See: https://git-scm.com/docs/pack-format
//!
//! Decoding never writes to the object store until the whole pack has been
//! checksummed, indexed and every delta resolved. Entries are addressed by
//! their index in the pack buffer; inflated delta bases live in a
//! byte-bounded LRU window and are re-inflated from the buffer on a miss.

use crate::delta::{apply_delta, delta_sizes, encode_delta};
use crate::{GitError, Result};
use bytes::Bytes;
use cairn_storage::{GitObject, ObjectId, ObjectStore, ObjectType, OBJECT_ID_LEN};
use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use lru::LruCache;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::Write;

/// Magic bytes at the start of a pack file.
const PACK_SIGNATURE: &[u8; 4] = b"PACK";
/// Pack version we write.
const PACK_VERSION: u32 = 2;
/// Header: signature, version, object count.
const HEADER_LEN: usize = 12;
/// SHA-1 trailer.
const TRAILER_LEN: usize = 20;

const OBJ_OFS_DELTA: u8 = 6;
const OBJ_REF_DELTA: u8 = 7;

/// Candidate bases considered per object when building with deltas.
const DELTA_WINDOW: usize = 10;
/// Longest delta chain the builder produces.
const MAX_BUILD_DEPTH: usize = 10;

fn corrupt(msg: impl Into<String>) -> GitError {
    GitError::CorruptPack(msg.into())
}

/// Resource bounds applied while decoding a pack.
#[derive(Debug, Clone)]
pub struct PackLimits {
    /// Largest accepted pack, trailer included.
    pub max_pack_bytes: usize,
    /// Largest accepted object count.
    pub max_objects: u32,
    /// Largest accepted inflated object or delta.
    pub max_object_bytes: usize,
    /// Longest accepted delta chain.
    pub max_delta_depth: usize,
    /// Memory budget for inflated delta bases.
    pub delta_cache_bytes: usize,
}

impl Default for PackLimits {
    fn default() -> Self {
        Self {
            max_pack_bytes: 512 * 1024 * 1024,
            max_objects: 1_000_000,
            max_object_bytes: 128 * 1024 * 1024,
            max_delta_depth: 64,
            delta_cache_bytes: 32 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum EntryKind {
    Whole(ObjectType),
    OfsDelta { base_offset: usize },
    RefDelta { base: ObjectId },
}

#[derive(Debug, Clone, Copy)]
struct PackEntry {
    offset: usize,
    kind: EntryKind,
    size: usize,
    data_start: usize,
    data_end: usize,
}

#[derive(Debug, Clone, Copy)]
struct Resolved {
    id: ObjectId,
    object_type: ObjectType,
    depth: usize,
}

/// An object found in a decoded pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackObject {
    /// Offset of the entry in the pack.
    pub offset: usize,
    /// Object id of the resolved content.
    pub id: ObjectId,
    /// Object type of the resolved content.
    pub object_type: ObjectType,
}

/// Initial and incremental output buffer size for inflation.
const INFLATE_CHUNK: usize = 64 * 1024;

/// Inflates a zlib stream that must expand to exactly `expected` bytes.
///
/// Returns the content and the number of compressed bytes consumed.
fn inflate(input: &[u8], expected: usize) -> Result<(Vec<u8>, usize)> {
    let mut z = Decompress::new(true);
    // Declared sizes are untrusted until the stream proves them.
    let mut out = Vec::with_capacity(expected.min(INFLATE_CHUNK) + 1);
    loop {
        if out.len() == out.capacity() {
            out.reserve_exact(INFLATE_CHUNK.min(expected + 1 - out.len()));
        }
        let (in_before, out_before) = (z.total_in(), z.total_out());
        let consumed = in_before as usize;
        let status = z
            .decompress_vec(&input[consumed..], &mut out, FlushDecompress::None)
            .map_err(|e| corrupt(format!("zlib: {}", e)))?;
        if status == Status::StreamEnd {
            break;
        }
        if out.len() > expected {
            return Err(corrupt("object inflates past its declared size"));
        }
        if z.total_in() == in_before && z.total_out() == out_before {
            return Err(corrupt("truncated zlib stream"));
        }
    }
    if out.len() != expected {
        return Err(corrupt(format!(
            "object inflated to {} bytes, header declares {}",
            out.len(),
            expected
        )));
    }
    Ok((out, z.total_in() as usize))
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn write_entry_header(pack: &mut Vec<u8>, type_code: u8, size: usize) {
    // First byte: (MSB=more bytes) (3 bits type) (4 bits size)
    let mut first_byte = (type_code << 4) | ((size & 0x0F) as u8);
    let mut remaining_size = size >> 4;
    if remaining_size > 0 {
        first_byte |= 0x80;
    }
    pack.push(first_byte);

    while remaining_size > 0 {
        let mut byte = (remaining_size & 0x7F) as u8;
        remaining_size >>= 7;
        if remaining_size > 0 {
            byte |= 0x80;
        }
        pack.push(byte);
    }
}

fn write_ofs_offset(pack: &mut Vec<u8>, mut distance: usize) {
    let mut buf = vec![(distance & 0x7f) as u8];
    distance >>= 7;
    while distance > 0 {
        distance -= 1;
        buf.push(0x80 | (distance & 0x7f) as u8);
        distance >>= 7;
    }
    buf.reverse();
    pack.extend_from_slice(&buf);
}

/// Builds a pack file from a set of objects.
#[derive(Debug, Default)]
pub struct PackBuilder {
    objects: Vec<GitObject>,
    deltas: bool,
}

impl PackBuilder {
    /// Creates a new pack builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits ofs-deltas against earlier similar objects when they pay off.
    pub fn with_deltas(mut self, enabled: bool) -> Self {
        self.deltas = enabled;
        self
    }

    /// Adds an object to the pack.
    pub fn add(&mut self, object: GitObject) {
        self.objects.push(object);
    }

    /// Adds an object from the store by ID.
    pub fn add_from_store(&mut self, store: &dyn ObjectStore, id: &ObjectId) -> Result<()> {
        let object = store.get(id)?;
        self.objects.push(object);
        Ok(())
    }

    /// Returns the number of objects added.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if no objects were added.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Builds the pack file.
    pub fn build(self) -> Result<Vec<u8>> {
        let mut pack = Vec::new();
        pack.extend_from_slice(PACK_SIGNATURE);
        pack.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&(self.objects.len() as u32).to_be_bytes());

        // (offset, depth) of each entry written so far
        let mut written: Vec<(usize, usize)> = Vec::with_capacity(self.objects.len());
        let mut deltas = 0usize;

        for (i, object) in self.objects.iter().enumerate() {
            let offset = pack.len();
            let candidate = if self.deltas {
                self.best_delta(i, &written)
            } else {
                None
            };

            match candidate {
                Some((base_idx, delta)) => {
                    let (base_offset, base_depth) = written[base_idx];
                    write_entry_header(&mut pack, OBJ_OFS_DELTA, delta.len());
                    write_ofs_offset(&mut pack, offset - base_offset);
                    pack.extend_from_slice(&deflate(&delta)?);
                    written.push((offset, base_depth + 1));
                    deltas += 1;
                }
                None => {
                    write_entry_header(&mut pack, object.object_type.pack_type(), object.size());
                    pack.extend_from_slice(&deflate(&object.data)?);
                    written.push((offset, 0));
                }
            }
        }

        let checksum = Sha1::digest(&pack);
        pack.extend_from_slice(&checksum);

        tracing::debug!(
            objects = self.objects.len(),
            deltas,
            bytes = pack.len(),
            "Built pack"
        );
        Ok(pack)
    }

    fn best_delta(&self, i: usize, written: &[(usize, usize)]) -> Option<(usize, Vec<u8>)> {
        let target = &self.objects[i];
        let size = target.size();
        if size < 64 {
            return None;
        }

        let mut best: Option<(usize, Vec<u8>)> = None;
        for j in (i.saturating_sub(DELTA_WINDOW)..i).rev() {
            let base = &self.objects[j];
            if base.object_type != target.object_type
                || written[j].1 >= MAX_BUILD_DEPTH
                || base.size() < size / 2
                || base.size() > size * 2
            {
                continue;
            }
            let delta = encode_delta(&base.data, &target.data);
            if delta.len() < size / 2 && best.as_ref().map_or(true, |(_, d)| delta.len() < d.len()) {
                best = Some((j, delta));
            }
        }
        best
    }
}

/// Byte-bounded LRU of inflated entry contents, keyed by entry index.
struct BaseCache {
    entries: LruCache<usize, Bytes>,
    bytes: usize,
    budget: usize,
}

impl BaseCache {
    fn new(budget: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            bytes: 0,
            budget,
        }
    }

    fn get(&mut self, idx: usize) -> Option<Bytes> {
        self.entries.get(&idx).cloned()
    }

    fn put(&mut self, idx: usize, data: Bytes) {
        if data.len() > self.budget {
            return;
        }
        while self.bytes + data.len() > self.budget {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.bytes -= evicted.len(),
                None => break,
            }
        }
        self.bytes += data.len();
        if let Some(old) = self.entries.put(idx, data) {
            self.bytes -= old.len();
        }
    }
}

/// Parses and validates a pack file.
pub struct PackParser<'a> {
    data: &'a [u8],
    limits: PackLimits,
}

impl<'a> PackParser<'a> {
    /// Creates a new pack parser with default limits.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            limits: PackLimits::default(),
        }
    }

    /// Replaces the decoding limits.
    pub fn with_limits(mut self, limits: PackLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Decodes and validates the pack, then writes every object to `store`.
    pub fn parse(self, store: &dyn ObjectStore) -> Result<Vec<ObjectId>> {
        let mut decoded = self.decode(store)?;
        decoded.write_to(store)
    }

    /// Fully validates the pack without writing anything.
    ///
    /// `store` is only read, to find bases of ref-deltas that are not in
    /// the pack itself.
    pub fn decode(self, store: &dyn ObjectStore) -> Result<DecodedPack<'a>> {
        let data = self.data;
        if data.len() > self.limits.max_pack_bytes {
            return Err(corrupt(format!(
                "pack of {} bytes exceeds limit of {}",
                data.len(),
                self.limits.max_pack_bytes
            )));
        }
        if data.len() < HEADER_LEN + TRAILER_LEN {
            return Err(corrupt("pack too small"));
        }
        if &data[0..4] != PACK_SIGNATURE {
            return Err(corrupt("invalid signature"));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != 2 && version != 3 {
            return Err(corrupt(format!("unsupported version: {}", version)));
        }
        let count = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        if count > self.limits.max_objects {
            return Err(corrupt(format!(
                "pack holds {} objects, limit is {}",
                count, self.limits.max_objects
            )));
        }

        let body_end = data.len() - TRAILER_LEN;
        let computed = Sha1::digest(&data[..body_end]);
        if computed.as_slice() != &data[body_end..] {
            return Err(corrupt("checksum mismatch"));
        }

        let entries = self.index(count as usize, body_end)?;
        let mut decoded = DecodedPack {
            data,
            offsets: entries
                .iter()
                .enumerate()
                .map(|(i, e)| (e.offset, i))
                .collect(),
            entries,
            resolved: Vec::new(),
            by_id: HashMap::new(),
            cache: BaseCache::new(self.limits.delta_cache_bytes),
            limits: self.limits,
        };
        decoded.resolve(store)?;
        Ok(decoded)
    }

    fn index(&self, count: usize, body_end: usize) -> Result<Vec<PackEntry>> {
        let data = self.data;
        let mut entries = Vec::with_capacity(count.min(body_end / 2));
        let mut pos = HEADER_LEN;

        for _ in 0..count {
            let offset = pos;
            let next = |pos: &mut usize| -> Result<u8> {
                if *pos >= body_end {
                    return Err(corrupt("unexpected end of pack"));
                }
                let byte = data[*pos];
                *pos += 1;
                Ok(byte)
            };

            let first_byte = next(&mut pos)?;
            let type_code = (first_byte >> 4) & 0x07;
            let mut size = (first_byte & 0x0F) as usize;
            let mut shift = 4u32;
            let mut byte = first_byte;
            while byte & 0x80 != 0 {
                byte = next(&mut pos)?;
                if shift > 56 {
                    return Err(corrupt("entry size overflow"));
                }
                size |= ((byte & 0x7F) as usize) << shift;
                shift += 7;
            }
            if size > self.limits.max_object_bytes {
                return Err(corrupt(format!(
                    "entry at {} declares {} bytes, limit is {}",
                    offset, size, self.limits.max_object_bytes
                )));
            }

            let kind = match type_code {
                OBJ_OFS_DELTA => {
                    let mut c = next(&mut pos)?;
                    let mut distance = (c & 0x7f) as usize;
                    while c & 0x80 != 0 {
                        c = next(&mut pos)?;
                        distance = distance
                            .checked_add(1)
                            .and_then(|d| d.checked_mul(128))
                            .ok_or_else(|| corrupt("ofs-delta offset overflow"))?
                            | (c & 0x7f) as usize;
                    }
                    let base_offset = offset
                        .checked_sub(distance)
                        .filter(|&b| distance > 0 && b >= HEADER_LEN)
                        .ok_or_else(|| {
                            corrupt(format!("ofs-delta at {} points outside the pack", offset))
                        })?;
                    EntryKind::OfsDelta { base_offset }
                }
                OBJ_REF_DELTA => {
                    let end = pos + OBJECT_ID_LEN;
                    if end > body_end {
                        return Err(corrupt("unexpected end of pack"));
                    }
                    let base = ObjectId::from_slice(&data[pos..end])?;
                    pos = end;
                    EntryKind::RefDelta { base }
                }
                code => EntryKind::Whole(
                    ObjectType::from_pack_type(code)
                        .map_err(|_| corrupt(format!("invalid entry type {} at {}", code, offset)))?,
                ),
            };

            let (_, consumed) = inflate(&data[pos..body_end], size)?;
            entries.push(PackEntry {
                offset,
                kind,
                size,
                data_start: pos,
                data_end: pos + consumed,
            });
            pos += consumed;
        }

        if pos != body_end {
            return Err(corrupt(format!(
                "{} bytes of trailing data after last entry",
                body_end - pos
            )));
        }
        Ok(entries)
    }
}

/// A pack whose checksum, entries and deltas have all been validated.
pub struct DecodedPack<'a> {
    data: &'a [u8],
    entries: Vec<PackEntry>,
    offsets: HashMap<usize, usize>,
    resolved: Vec<Option<Resolved>>,
    by_id: HashMap<ObjectId, usize>,
    cache: BaseCache,
    limits: PackLimits,
}

impl DecodedPack<'_> {
    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the pack holds no objects.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns every object in pack order.
    pub fn objects(&self) -> Vec<PackObject> {
        self.entries
            .iter()
            .zip(&self.resolved)
            .filter_map(|(entry, resolved)| {
                resolved.map(|r| PackObject {
                    offset: entry.offset,
                    id: r.id,
                    object_type: r.object_type,
                })
            })
            .collect()
    }

    /// Returns true if the pack carries `id`.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Writes every object to `store` in pack order.
    pub fn write_to(&mut self, store: &dyn ObjectStore) -> Result<Vec<ObjectId>> {
        let mut ids = Vec::with_capacity(self.entries.len());
        for idx in 0..self.entries.len() {
            let resolved = self.resolved[idx]
                .ok_or_else(|| corrupt(format!("entry {} unresolved", idx)))?;
            let content = self.content(idx, store, 0)?;
            let object = GitObject::new(resolved.object_type, content);
            ids.push(store.put(object)?);
        }
        tracing::debug!(objects = ids.len(), "Wrote pack objects");
        Ok(ids)
    }

    fn resolve(&mut self, store: &dyn ObjectStore) -> Result<()> {
        self.resolved = vec![None; self.entries.len()];
        let mut remaining = self.entries.len();

        while remaining > 0 {
            let mut progressed = false;
            for idx in 0..self.entries.len() {
                if self.resolved[idx].is_some() {
                    continue;
                }
                let entry = self.entries[idx];
                let base = match entry.kind {
                    EntryKind::Whole(object_type) => Some((object_type, 0)),
                    EntryKind::OfsDelta { base_offset } => {
                        let base_idx = self.base_index(base_offset)?;
                        self.resolved[base_idx].map(|r| (r.object_type, r.depth + 1))
                    }
                    EntryKind::RefDelta { base } => match self.by_id.get(&base) {
                        Some(&base_idx) => {
                            self.resolved[base_idx].map(|r| (r.object_type, r.depth + 1))
                        }
                        None if store.contains(&base)? => {
                            Some((store.get(&base)?.object_type, 1))
                        }
                        None => None,
                    },
                };

                let Some((object_type, depth)) = base else {
                    continue;
                };
                if depth > self.limits.max_delta_depth {
                    return Err(corrupt(format!(
                        "delta chain at {} exceeds depth {}",
                        entry.offset, self.limits.max_delta_depth
                    )));
                }

                let content = self.content(idx, store, 0)?;
                let id = ObjectId::hash_object(object_type, &content);
                self.resolved[idx] = Some(Resolved {
                    id,
                    object_type,
                    depth,
                });
                self.by_id.entry(id).or_insert(idx);
                remaining -= 1;
                progressed = true;
            }

            if !progressed {
                break;
            }
        }

        if remaining == 0 {
            return Ok(());
        }

        for (idx, entry) in self.entries.iter().enumerate() {
            if self.resolved[idx].is_some() {
                continue;
            }
            if let EntryKind::RefDelta { base } = entry.kind {
                if !self.by_id.contains_key(&base) && !store.contains(&base)? {
                    return Err(GitError::UnknownObject(base));
                }
            }
        }
        Err(corrupt("delta cycle"))
    }

    fn base_index(&self, base_offset: usize) -> Result<usize> {
        self.offsets
            .get(&base_offset)
            .copied()
            .ok_or_else(|| corrupt(format!("no entry starts at offset {}", base_offset)))
    }

    /// Reconstructs the content of entry `idx`.
    fn content(&mut self, idx: usize, store: &dyn ObjectStore, depth: usize) -> Result<Bytes> {
        if let Some(data) = self.cache.get(idx) {
            return Ok(data);
        }
        if depth > self.limits.max_delta_depth {
            return Err(corrupt("delta chain too deep"));
        }

        let entry = self.entries[idx];
        let (payload, _) = inflate(&self.data[entry.data_start..entry.data_end], entry.size)?;

        let content: Bytes = match entry.kind {
            EntryKind::Whole(_) => payload.into(),
            EntryKind::OfsDelta { base_offset } => {
                let base_idx = self.base_index(base_offset)?;
                let base = self.content(base_idx, store, depth + 1)?;
                self.apply(&base, &payload)?.into()
            }
            EntryKind::RefDelta { base } => {
                let base = match self.by_id.get(&base) {
                    Some(&base_idx) => self.content(base_idx, store, depth + 1)?,
                    None => store.get(&base)?.data,
                };
                self.apply(&base, &payload)?.into()
            }
        };

        if !matches!(entry.kind, EntryKind::Whole(_)) || depth > 0 {
            self.cache.put(idx, content.clone());
        }
        Ok(content)
    }

    fn apply(&self, base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
        let (_, target_size) = delta_sizes(delta)?;
        if target_size > self.limits.max_object_bytes {
            return Err(corrupt(format!(
                "delta target of {} bytes exceeds limit of {}",
                target_size, self.limits.max_object_bytes
            )));
        }
        apply_delta(base, delta)
    }
}
