//! Compressed vector registry: Matryoshka (MRL) truncation, int8 scalar
//! quantization, a flat in-RAM buffer searched by a `rayon`-driven top-k
//! fan-out, and `memmap2`-backed persistence of the quantized snapshot.
//!
//! The distilled design pins the quantization scale to the unit-norm
//! assumption (`round(clamp(v,-1,1)*127)`) rather than the teacher's
//! per-vector min/max `SQ8Quantizer` — every vector here is L2-normalized
//! before quantization, so a fixed scale is both simpler and exact for
//! this use case; see DESIGN.md.

use crate::dictionary::AnyDictionary;
use crate::error::{Result, StoreError};
use crate::keycodec::encode_full_vector_key;
use crate::kv::KvEngine;
use ahash::AHashMap;
use memmap2::Mmap;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use crossbeam::channel;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub const FULL_DIM: usize = 768;
pub const MRL_DIM: usize = 64;

/// `ProcessMRL`: truncate/pad to `MRL_DIM`, then L2-normalize. Magnitude
/// below `1e-10` yields the zero vector rather than dividing by it.
pub fn process_mrl(v: &[f32]) -> [f32; MRL_DIM] {
    let mut out = [0.0f32; MRL_DIM];
    let n = v.len().min(MRL_DIM);
    out[..n].copy_from_slice(&v[..n]);

    let mag: f32 = out.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag < 1e-10 {
        return [0.0f32; MRL_DIM];
    }
    for x in out.iter_mut() {
        *x /= mag;
    }
    out
}

/// `Quantize`: `round(clamp(v,-1,1) * 127)`.
pub fn quantize(v: &[f32; MRL_DIM]) -> [i8; MRL_DIM] {
    let mut out = [0i8; MRL_DIM];
    for (i, x) in v.iter().enumerate() {
        out[i] = (x.clamp(-1.0, 1.0) * 127.0).round() as i8;
    }
    out
}

/// 8-wide unrolled int8 dot product with `i32` accumulators. `a` and `b`
/// must both be `MRL_DIM` long; the two tail-free chunk loops give the
/// compiler bounds-check elimination on the common, fixed-length path.
#[inline]
pub fn dot_product_i8(a: &[i8], b: &[i8]) -> i32 {
    debug_assert_eq!(a.len(), MRL_DIM);
    debug_assert_eq!(b.len(), MRL_DIM);
    let mut acc = 0i32;
    let a_chunks = a.chunks_exact(8);
    let b_chunks = b.chunks_exact(8);
    for (ca, cb) in a_chunks.zip(b_chunks) {
        acc += ca[0] as i32 * cb[0] as i32;
        acc += ca[1] as i32 * cb[1] as i32;
        acc += ca[2] as i32 * cb[2] as i32;
        acc += ca[3] as i32 * cb[3] as i32;
        acc += ca[4] as i32 * cb[4] as i32;
        acc += ca[5] as i32 * cb[5] as i32;
        acc += ca[6] as i32 * cb[6] as i32;
        acc += ca[7] as i32 * cb[7] as i32;
    }
    acc
}

/// Maps an int8 dot product of two unit-norm-then-quantized vectors back
/// into `[-1, 1]`: `127 * 127 == 16129`.
pub const SCORE_SCALE: f32 = 16129.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub id: u64,
    pub score: f32,
}

/// The flat quantized buffer backing a registry: either a memory-mapped
/// snapshot aliased in place, or an owned, growable `Vec<i8>` once the
/// registry has been written to. `Mapped` never copies — reads go straight
/// through the mapping — so a process that opens a store and only ever
/// searches pays no heap cost for the buffer at all.
enum Backing {
    Mapped(Mmap),
    Owned(Vec<i8>),
}

impl Backing {
    fn as_i8_slice(&self) -> &[i8] {
        match self {
            Backing::Owned(v) => v.as_slice(),
            // SAFETY: i8 and u8 share size and alignment; every byte
            // pattern is valid for both, so this is a same-size
            // reinterpret of memory the mapping keeps alive for as long
            // as `self` does.
            Backing::Mapped(m) => unsafe { std::slice::from_raw_parts(m.as_ptr() as *const i8, m.len()) },
        }
    }
}

struct RegistryData {
    data: Arc<Backing>,          // flat, contiguous, len == count * MRL_DIM
    id_map: AHashMap<u64, usize>, // id -> internal index
    rev_map: Vec<u64>,           // internal index -> id
    string_ids: Vec<Option<String>>, // internal index -> optional symbol key
}

impl RegistryData {
    fn new() -> Self {
        Self {
            data: Arc::new(Backing::Owned(Vec::new())),
            id_map: AHashMap::new(),
            rev_map: Vec::new(),
            string_ids: Vec::new(),
        }
    }

    fn count(&self) -> usize {
        self.rev_map.len()
    }

    /// Returns a mutable owned buffer, promoting from a mapped or
    /// still-shared backing first. A search that already cloned the `Arc`
    /// before this call keeps scanning its own snapshot even if this call
    /// grows or rewrites the buffer underneath it.
    fn data_mut(&mut self) -> &mut Vec<i8> {
        let needs_copy = !matches!(*self.data, Backing::Owned(_)) || Arc::get_mut(&mut self.data).is_none();
        if needs_copy {
            let copy = self.data.as_i8_slice().to_vec();
            self.data = Arc::new(Backing::Owned(copy));
        }
        match Arc::get_mut(&mut self.data) {
            Some(Backing::Owned(v)) => v,
            _ => unreachable!("just promoted to a uniquely-owned buffer"),
        }
    }
}

/// The compressed vector registry. One RW lock covers mutation; searches
/// take only the read side, and the snapshot of `data`/`rev_map` used by a
/// search is taken under the read lock then released before the CPU-heavy
/// scan — readers never block each other, and a write blocks readers only
/// for the duration of the in-place slice update.
pub struct VectorRegistry {
    engine: Arc<KvEngine>,
    dict: Arc<AnyDictionary>,
    registry: RwLock<RegistryData>,
    snapshot_dir: Option<PathBuf>,
    pending_writes: channel::Sender<(u64, Vec<f32>)>,
    writer_thread: Option<JoinHandle<()>>,
    pending_count: Arc<AtomicUsize>,
}

impl VectorRegistry {
    pub fn new(engine: Arc<KvEngine>, dict: Arc<AnyDictionary>, snapshot_dir: Option<PathBuf>) -> Result<Self> {
        let registry = RwLock::new(load_snapshot(snapshot_dir.as_deref())?);

        let (tx, rx) = channel::unbounded::<(u64, Vec<f32>)>();
        let pending_count = Arc::new(AtomicUsize::new(0));
        let writer_engine = engine.clone();
        let writer_counter = pending_count.clone();
        let writer_thread = std::thread::spawn(move || {
            while let Ok((id, vec)) = rx.recv() {
                let mut bytes = Vec::with_capacity(vec.len() * 4);
                for f in &vec {
                    bytes.extend_from_slice(&f.to_le_bytes());
                }
                if let Err(e) = writer_engine.put(encode_full_vector_key(id), bytes) {
                    eprintln!("vector registry: async full-vector persist failed for id {id}: {e}");
                }
                writer_counter.fetch_sub(1, Ordering::AcqRel);
            }
        });

        Ok(Self {
            engine,
            dict,
            registry,
            snapshot_dir,
            pending_writes: tx,
            writer_thread: Some(writer_thread),
            pending_count,
        })
    }

    pub fn add(&self, id: u64, full_vec: &[f32]) -> Result<()> {
        self.add_with_string_id(id, None, full_vec)
    }

    /// Ingest a vector: MRL-truncate, normalize, quantize, then either
    /// overwrite the existing slot (re-ingest by id) or append a new one.
    /// The full float32 vector is persisted asynchronously under its own
    /// key for later exact rerank.
    pub fn add_with_string_id(&self, id: u64, string_id: Option<String>, full_vec: &[f32]) -> Result<()> {
        let mrl = process_mrl(full_vec);
        let q = quantize(&mrl);

        {
            let mut reg = self.registry.write();
            if let Some(&idx) = reg.id_map.get(&id) {
                let start = idx * MRL_DIM;
                reg.data_mut()[start..start + MRL_DIM].copy_from_slice(&q);
                if string_id.is_some() {
                    reg.string_ids[idx] = string_id;
                }
            } else {
                let idx = reg.count();
                reg.data_mut().extend_from_slice(&q);
                reg.rev_map.push(id);
                reg.string_ids.push(string_id);
                reg.id_map.insert(id, idx);
            }
        }

        self.pending_count.fetch_add(1, Ordering::AcqRel);
        let _ = self.pending_writes.send((id, full_vec.to_vec()));
        Ok(())
    }

    /// Top-k search: partitions the flat buffer across
    /// `min(num_cpus, count)` `rayon` workers, each maintaining an
    /// insertion-sorted local top-k, then merges. Scores are
    /// non-increasing, at most `k` items are returned, and every returned
    /// id was present in the registry at the moment of the snapshot. The
    /// snapshot itself is an `Arc` clone of the backing buffer taken under
    /// the read lock and released before the scan — for a registry still
    /// backed by a memory-mapped snapshot this is a refcount bump, not a
    /// heap copy.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mrl = process_mrl(query);
        let q = quantize(&mrl);

        let (data, rev_map) = {
            let reg = self.registry.read();
            (reg.data.clone(), reg.rev_map.clone())
        };
        let count = rev_map.len();
        if count == 0 {
            return Ok(Vec::new());
        }

        use rayon::prelude::*;
        let num_workers = rayon::current_num_threads().min(count).max(1);
        let chunk = count.div_ceil(num_workers);
        let data_slice = data.as_i8_slice();

        let tops: Vec<Vec<SearchHit>> = (0..num_workers)
            .into_par_iter()
            .map(|w| {
                let start = w * chunk;
                let end = (start + chunk).min(count);
                let mut local: Vec<SearchHit> = Vec::with_capacity(k);
                for i in start..end {
                    let slice = &data_slice[i * MRL_DIM..(i + 1) * MRL_DIM];
                    let score = dot_product_i8(&q, slice) as f32 / SCORE_SCALE;
                    let hit = SearchHit { id: rev_map[i], score };
                    insert_sorted_topk(&mut local, hit, k);
                }
                local
            })
            .collect();

        let mut merged: Vec<SearchHit> = tops.into_iter().flatten().collect();
        merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        merged.truncate(k);
        Ok(merged)
    }

    pub fn count(&self) -> usize {
        self.registry.read().count()
    }

    /// Fetch the exact float32 vector persisted for a string id, if any.
    pub fn get_full_vector(&self, string_id: &str) -> Result<Option<Vec<f32>>> {
        let Some(id) = self.dict.get_id(string_id)? else {
            return Ok(None);
        };
        let Some(bytes) = self.engine.get(&encode_full_vector_key(id))? else {
            return Ok(None);
        };
        if bytes.len() % 4 != 0 {
            return Err(StoreError::Corruption("full vector value not a multiple of 4 bytes".into()));
        }
        Ok(Some(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ))
    }

    /// Block until every in-flight async full-vector write has landed,
    /// then snapshot the quantized buffer to disk. No-op when no
    /// `snapshot_dir` was configured (e.g. an in-memory store).
    pub fn snapshot(&self) -> Result<()> {
        self.drain_pending();
        let Some(dir) = &self.snapshot_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        let reg = self.registry.read();

        let data_path = dir.join("vectors.bin");
        let mut f = OpenOptions::new().create(true).write(true).truncate(true).open(&data_path)?;
        let bytes: &[u8] = bytemuck_i8_slice(reg.data.as_i8_slice());
        f.write_all(bytes)?;
        f.sync_all()?;

        let mut id_bytes = Vec::with_capacity(reg.rev_map.len() * 8);
        for id in &reg.rev_map {
            id_bytes.extend_from_slice(&id.to_be_bytes());
        }
        std::fs::write(dir.join("ids.bin"), &id_bytes)?;

        let mut sym_bytes = Vec::new();
        for s in &reg.string_ids {
            let bytes = s.as_deref().unwrap_or("").as_bytes();
            sym_bytes.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            sym_bytes.extend_from_slice(bytes);
        }
        std::fs::write(dir.join("symbols.bin"), &sym_bytes)?;

        Ok(())
    }

    fn drain_pending(&self) {
        while self.pending_count.load(Ordering::Acquire) > 0 {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    pub fn close(&mut self) -> Result<()> {
        self.snapshot()?;
        Ok(())
    }
}

impl Drop for VectorRegistry {
    fn drop(&mut self) {
        self.drain_pending();
    }
}

fn bytemuck_i8_slice(data: &[i8]) -> &[u8] {
    // SAFETY: i8 and u8 have identical size/alignment; this is a
    // same-size reinterpret, not a lifetime-extending cast.
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, data.len()) }
}

/// Insert `hit` into a local top-k buffer kept sorted descending by score,
/// bubbling the new entry up to its position and dropping the tail once
/// the buffer exceeds `k`.
fn insert_sorted_topk(buf: &mut Vec<SearchHit>, hit: SearchHit, k: usize) {
    if buf.len() < k {
        let pos = buf.partition_point(|h| h.score >= hit.score);
        buf.insert(pos, hit);
    } else if let Some(last) = buf.last() {
        if hit.score > last.score {
            let pos = buf.partition_point(|h| h.score >= hit.score);
            buf.insert(pos, hit);
            buf.pop();
        }
    }
}

/// Load a persisted snapshot, if one exists: the quantized buffer is
/// memory-mapped read-only and aliased in place as the registry's `data`
/// buffer, with no heap copy at load time. The first write through
/// `add_with_string_id` promotes it to an owned `Vec<i8>` (one copy, not
/// one per load), so a store that's opened and only ever searched never
/// pays for the copy at all. A size mismatch between the mapped file and
/// the id array is treated as corruption of that snapshot: it's logged
/// and the registry starts empty rather than silently exposing misaligned
/// entries.
fn load_snapshot(dir: Option<&Path>) -> Result<RegistryData> {
    let Some(dir) = dir else {
        return Ok(RegistryData::new());
    };
    let data_path = dir.join("vectors.bin");
    let ids_path = dir.join("ids.bin");
    if !data_path.exists() || !ids_path.exists() {
        return Ok(RegistryData::new());
    }

    let file = File::open(&data_path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let id_bytes = std::fs::read(&ids_path)?;

    let count_by_ids = id_bytes.len() / 8;
    let count_by_data = mmap.len() / MRL_DIM;
    if id_bytes.len() % 8 != 0 || mmap.len() % MRL_DIM != 0 || count_by_ids != count_by_data {
        eprintln!(
            "vector registry: snapshot size mismatch (ids={}, vectors={}) — starting empty",
            count_by_ids, count_by_data
        );
        return Ok(RegistryData::new());
    }

    let rev_map: Vec<u64> = id_bytes
        .chunks_exact(8)
        .map(|c| {
            let mut b = [0u8; 8];
            b.copy_from_slice(c);
            u64::from_be_bytes(b)
        })
        .collect();

    let symbols_path = dir.join("symbols.bin");
    let string_ids = if symbols_path.exists() {
        read_symbol_array(&symbols_path, rev_map.len())?
    } else {
        vec![None; rev_map.len()]
    };

    let mut id_map = AHashMap::with_capacity(rev_map.len());
    for (idx, id) in rev_map.iter().enumerate() {
        id_map.insert(*id, idx);
    }

    Ok(RegistryData {
        data: Arc::new(Backing::Mapped(mmap)),
        id_map,
        rev_map,
        string_ids,
    })
}

fn read_symbol_array(path: &Path, expected: usize) -> Result<Vec<Option<String>>> {
    let bytes = std::fs::read(path)?;
    let mut out = Vec::with_capacity(expected);
    let mut pos = 0;
    while pos + 4 <= bytes.len() {
        let len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + len > bytes.len() {
            break;
        }
        let s = String::from_utf8_lossy(&bytes[pos..pos + len]).into_owned();
        out.push(if s.is_empty() { None } else { Some(s) });
        pos += len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::IdAllocator;
    use crate::config::StoreConfig;
    use crate::dictionary::Dictionary;
    use tempfile::TempDir;

    fn harness() -> (Arc<KvEngine>, Arc<AnyDictionary>) {
        let engine = Arc::new(KvEngine::open(None, &StoreConfig::default()).unwrap());
        let alloc = Arc::new(IdAllocator::new(engine.clone(), 1000).unwrap());
        let dict = Arc::new(AnyDictionary::Single(Dictionary::new(engine.clone(), alloc, 1000)));
        (engine, dict)
    }

    #[test]
    fn s6_quantize_unit_vector_and_self_dot_product() {
        let mut v = [0.0f32; MRL_DIM];
        v[0] = 1.0;
        let mrl = process_mrl(&v);
        let q = quantize(&mrl);
        assert_eq!(q[0], 127);
        assert!(q[1..].iter().all(|&x| x == 0));
        let score = dot_product_i8(&q, &q) as f32 / SCORE_SCALE;
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn process_mrl_pads_short_vectors() {
        let v = vec![1.0f32, 0.0, 0.0];
        let mrl = process_mrl(&v);
        assert!((mrl[0] - 1.0).abs() < 1e-6);
        assert!(mrl[3..].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn process_mrl_truncates_long_vectors() {
        let v = vec![1.0f32; FULL_DIM];
        let mrl = process_mrl(&v);
        assert_eq!(mrl.len(), MRL_DIM);
    }

    #[test]
    fn zero_vector_stays_zero() {
        let v = [0.0f32; MRL_DIM];
        let mrl = process_mrl(&v);
        assert!(mrl.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn search_returns_at_most_k_non_increasing_scores() {
        let (engine, dict) = harness();
        let reg = VectorRegistry::new(engine, dict, None).unwrap();
        for i in 0..20u64 {
            let mut v = vec![0.0f32; FULL_DIM];
            v[i as usize % FULL_DIM] = 1.0;
            reg.add(i + 1, &v).unwrap();
        }
        let mut q = vec![0.0f32; FULL_DIM];
        q[0] = 1.0;
        let hits = reg.search(&q, 5).unwrap();
        assert!(hits.len() <= 5);
        for w in hits.windows(2) {
            assert!(w[0].score >= w[1].score);
        }
    }

    #[test]
    fn add_overwrites_existing_id_in_place() {
        let (engine, dict) = harness();
        let reg = VectorRegistry::new(engine, dict, None).unwrap();
        let mut v1 = vec![0.0f32; FULL_DIM];
        v1[0] = 1.0;
        reg.add(1, &v1).unwrap();
        assert_eq!(reg.count(), 1);
        let mut v2 = vec![0.0f32; FULL_DIM];
        v2[1] = 1.0;
        reg.add(1, &v2).unwrap();
        assert_eq!(reg.count(), 1, "re-ingest by id overwrites, does not append");
    }

    #[test]
    fn brute_force_top1_matches_exact_nearest_neighbor() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let (engine, dict) = harness();
        let reg = VectorRegistry::new(engine, dict, None).unwrap();

        let mut vectors = Vec::new();
        for i in 0..50u64 {
            let v: Vec<f32> = (0..FULL_DIM).map(|_| rng.gen_range(-1.0..1.0)).collect();
            reg.add(i + 1, &v).unwrap();
            vectors.push(v);
        }

        let query: Vec<f32> = (0..FULL_DIM).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let query_mrl = process_mrl(&query);
        let query_q = quantize(&query_mrl);

        let expected_best = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let q = quantize(&process_mrl(v));
                (i as u64 + 1, dot_product_i8(&query_q, &q))
            })
            .max_by_key(|&(_, score)| score)
            .unwrap()
            .0;

        let hits = reg.search(&query, 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, expected_best);
    }

    #[test]
    fn snapshot_and_reload_round_trips() {
        let dir = TempDir::new().unwrap();
        let (engine, dict) = harness();
        {
            let reg = VectorRegistry::new(engine.clone(), dict.clone(), Some(dir.path().to_path_buf())).unwrap();
            let mut v = vec![0.0f32; FULL_DIM];
            v[5] = 1.0;
            reg.add_with_string_id(1, Some("doc-1".to_string()), &v).unwrap();
            reg.snapshot().unwrap();
        }
        let reg2 = VectorRegistry::new(engine, dict, Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(reg2.count(), 1);
    }
}
