//! Persistent-memory heap: memory-mapped region files plus a registry recording which list owns
//! each region, so a list's chunks can be found again after a restart.
//!
//! Layout of a heap directory:
//! - `REGISTRY.bin`: magic + version + len + crc32 + bincode(`Registry`), replaced atomically.
//! - `region_<id>.pmem`: a 64-byte header followed by `capacity` fixed-width slots.
//!
//! Region header: magic (8) | data type tag (1) | pad (3) | slot width u32 | capacity u32 |
//! committed u32 | region id u64 | zero padding.

use crate::element::slot_width_of;
use crate::error::BufferError;
use crate::types::{ChunkRole, DataType, SeriesKey};

use crc32fast::Hasher as Crc32;
use memmap2::MmapMut;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const REGION_MAGIC: &[u8; 8] = b"TVBPMEM1";
pub const REGION_HEADER_LEN: usize = 64;

const OFF_TAG: usize = 8;
const OFF_SLOT_WIDTH: usize = 12;
const OFF_CAPACITY: usize = 16;
const OFF_COMMITTED: usize = 20;
const OFF_ID: usize = 24;

const REGISTRY_MAGIC: &[u8; 8] = b"TVBREG01";
const REGISTRY_VERSION: u32 = 1;
const REGISTRY_FILE: &str = "REGISTRY.bin";

/// The (list, role, position) a persistent region is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkOwner {
    pub series: SeriesKey,
    pub role: ChunkRole,
    /// Position of the chunk within its sequence.
    pub ordinal: u32,
}

impl ChunkOwner {
    pub fn new(series: &SeriesKey, role: ChunkRole, ordinal: usize) -> Self {
        ChunkOwner {
            series: series.clone(),
            role,
            ordinal: ordinal as u32,
        }
    }

    fn nth(&self, offset: usize) -> Self {
        ChunkOwner {
            series: self.series.clone(),
            role: self.role,
            ordinal: self.ordinal + offset as u32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionRecord {
    pub id: u64,
    pub data_type: DataType,
    /// Heap epoch in which the region file was created.
    pub epoch: u64,
    pub owner: Option<ChunkOwner>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Registry {
    epoch: u64,
    next_region_id: u64,
    regions: BTreeMap<u64, RegionRecord>,
}

/// One mapped region file holding a single chunk.
pub struct PmemRegion {
    id: u64,
    epoch: u64,
    data_type: DataType,
    capacity: usize,
    slot_width: usize,
    map: MmapMut,
}

impl fmt::Debug for PmemRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PmemRegion")
            .field("id", &self.id)
            .field("epoch", &self.epoch)
            .field("data_type", &self.data_type)
            .field("capacity", &self.capacity)
            .field("slot_width", &self.slot_width)
            .field("committed", &self.committed())
            .finish()
    }
}

impl PmemRegion {
    fn create(
        path: &Path,
        id: u64,
        epoch: u64,
        data_type: DataType,
        capacity: usize,
        slot_width: usize,
    ) -> Result<Self, BufferError> {
        // A file left behind by a crash before its registry entry was written is unreferenced.
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len((REGION_HEADER_LEN + capacity * slot_width) as u64)?;

        // SAFETY: region files are private to the heap directory and mapped by exactly one
        // `PmemRegion` at a time; the file outlives no mapping it backs.
        let mut map = unsafe { MmapMut::map_mut(&file)? };

        map[..8].copy_from_slice(REGION_MAGIC);
        map[OFF_TAG] = data_type.tag();
        write_u32(&mut map, OFF_SLOT_WIDTH, slot_width as u32);
        write_u32(&mut map, OFF_CAPACITY, capacity as u32);
        write_u32(&mut map, OFF_COMMITTED, 0);
        map[OFF_ID..OFF_ID + 8].copy_from_slice(&id.to_le_bytes());
        map.flush_range(0, REGION_HEADER_LEN)?;

        Ok(PmemRegion {
            id,
            epoch,
            data_type,
            capacity,
            slot_width,
            map,
        })
    }

    fn open(path: &Path, record: &RegionRecord) -> Result<Self, BufferError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < REGION_HEADER_LEN {
            return Err(BufferError::corruption(
                format!("Region file {:?} shorter than its header", path),
                Some(record.id),
            ));
        }

        // SAFETY: see `create`.
        let map = unsafe { MmapMut::map_mut(&file)? };

        if &map[..8] != REGION_MAGIC {
            return Err(BufferError::corruption(
                format!("Bad region magic in {:?}", path),
                Some(record.id),
            ));
        }
        if DataType::from_tag(map[OFF_TAG]) != Some(record.data_type) {
            return Err(BufferError::corruption(
                format!(
                    "Region {} header type tag {} does not match registry type {}",
                    record.id, map[OFF_TAG], record.data_type
                ),
                Some(record.id),
            ));
        }
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&map[OFF_ID..OFF_ID + 8]);
        if u64::from_le_bytes(id_bytes) != record.id {
            return Err(BufferError::corruption(
                format!("Region id mismatch in {:?}", path),
                Some(record.id),
            ));
        }
        let slot_width = read_u32(&map, OFF_SLOT_WIDTH) as usize;
        let capacity = read_u32(&map, OFF_CAPACITY) as usize;
        if REGION_HEADER_LEN + capacity * slot_width != len {
            return Err(BufferError::corruption(
                format!("Region {} size does not match its header", record.id),
                Some(record.id),
            ));
        }
        if read_u32(&map, OFF_COMMITTED) as usize > capacity {
            return Err(BufferError::corruption(
                format!("Region {} committed length exceeds capacity", record.id),
                Some(record.id),
            ));
        }

        Ok(PmemRegion {
            id: record.id,
            epoch: record.epoch,
            data_type: record.data_type,
            capacity,
            slot_width,
            map,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn slot(&self, index: usize) -> &[u8] {
        let off = REGION_HEADER_LEN + index * self.slot_width;
        &self.map[off..off + self.slot_width]
    }

    #[inline]
    pub fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        let off = REGION_HEADER_LEN + index * self.slot_width;
        &mut self.map[off..off + self.slot_width]
    }

    #[inline]
    pub fn committed(&self) -> usize {
        read_u32(&self.map, OFF_COMMITTED) as usize
    }

    #[inline]
    pub fn set_committed(&mut self, len: usize) {
        write_u32(&mut self.map, OFF_COMMITTED, len as u32);
    }

    pub fn sync(&self) -> Result<(), BufferError> {
        self.map.flush()?;
        Ok(())
    }

    /// Bytes this region maps.
    pub fn mapped_len(&self) -> usize {
        self.map.len()
    }
}

/// Summary of what `PersistentHeap::open` found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapOpenReport {
    pub epoch: u64,
    pub regions: usize,
    pub free_regions: usize,
    pub parked_series: usize,
}

/// All persistent regions of one heap directory and their ownership.
#[derive(Debug)]
pub struct PersistentHeap {
    dir: PathBuf,
    registry: Registry,
    /// Idle regions keyed by (element kind, creation epoch).
    free: BTreeMap<(DataType, u64), Vec<PmemRegion>>,
    /// Owned regions not attached to a live list, waiting for `take_parked`.
    parked: HashMap<SeriesKey, Vec<PmemRegion>>,
    /// Series held by a live list.
    claimed: HashSet<SeriesKey>,
    in_use: usize,
    mapped_bytes: u64,
    array_size: usize,
    text_slot_bytes: usize,
}

impl PersistentHeap {
    /// Opens (or creates) the heap in `dir`, starting a new epoch.
    ///
    /// Regions owned by a list are parked for recovery; unowned regions become free.
    pub fn open<P: AsRef<Path>>(
        dir: P,
        array_size: usize,
        text_slot_bytes: usize,
    ) -> Result<(Self, HeapOpenReport), BufferError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let registry_path = dir.join(REGISTRY_FILE);
        let mut registry = if registry_path.exists() {
            read_registry(&registry_path)?
        } else {
            Registry::default()
        };
        registry.epoch += 1;

        let records: Vec<&RegionRecord> = registry.regions.values().collect();
        let regions = records
            .par_iter()
            .map(|rec| PmemRegion::open(&region_path(&dir, rec.id), rec))
            .collect::<Result<Vec<_>, BufferError>>()?;

        let mut free: BTreeMap<(DataType, u64), Vec<PmemRegion>> = BTreeMap::new();
        let mut parked: HashMap<SeriesKey, Vec<PmemRegion>> = HashMap::new();
        let region_count = regions.len();
        let mapped_bytes = regions.iter().map(|r| r.mapped_len() as u64).sum();
        let mut free_regions = 0;
        for region in regions {
            let expected_width = slot_width_of(region.data_type, text_slot_bytes);
            if region.capacity != array_size || region.slot_width != expected_width {
                return Err(BufferError::ConfigError(format!(
                    "Region {} was created with capacity {} and slot width {}, but the pool is configured for capacity {} and slot width {}",
                    region.id, region.capacity, region.slot_width, array_size, expected_width
                )));
            }
            match registry.regions.get(&region.id).and_then(|r| r.owner.as_ref()) {
                Some(owner) => parked.entry(owner.series.clone()).or_default().push(region),
                None => {
                    free_regions += 1;
                    free.entry((region.data_type, region.epoch))
                        .or_default()
                        .push(region);
                }
            }
        }

        write_registry_atomic(&registry_path, &registry)?;

        let report = HeapOpenReport {
            epoch: registry.epoch,
            regions: region_count,
            free_regions,
            parked_series: parked.len(),
        };
        let heap = PersistentHeap {
            dir,
            registry,
            free,
            parked,
            claimed: HashSet::new(),
            in_use: 0,
            mapped_bytes,
            array_size,
            text_slot_bytes,
        };
        Ok((heap, report))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn epoch(&self) -> u64 {
        self.registry.epoch
    }

    pub fn region_count(&self) -> usize {
        self.registry.regions.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Total bytes of all region files mapped by this heap.
    pub fn mapped_bytes(&self) -> u64 {
        self.mapped_bytes
    }

    pub fn parked_count(&self) -> usize {
        self.parked.values().map(Vec::len).sum()
    }

    /// Takes `count` regions bound to consecutive ordinals starting at `owner`, reusing free
    /// regions before creating files. Returns the regions and how many were newly created.
    ///
    /// All or nothing: on failure no region stays bound.
    pub fn allocate(
        &mut self,
        data_type: DataType,
        owner: &ChunkOwner,
        count: usize,
    ) -> Result<(Vec<PmemRegion>, usize), BufferError> {
        let requests: Vec<(DataType, ChunkOwner)> =
            (0..count).map(|i| (data_type, owner.nth(i))).collect();
        let taken = self.allocate_bound(&requests)?;
        let created = taken.iter().filter(|(_, created)| *created).count();
        Ok((taken.into_iter().map(|(region, _)| region).collect(), created))
    }

    /// Takes one region per request and binds it to the request's owner. Every binding lands in
    /// a single registry write, so after a crash either all of them are on disk or none is.
    ///
    /// Regions come back in request order, each flagged with whether its file was newly created.
    pub fn allocate_bound(
        &mut self,
        requests: &[(DataType, ChunkOwner)],
    ) -> Result<Vec<(PmemRegion, bool)>, BufferError> {
        let mut taken: Vec<(PmemRegion, bool)> = Vec::with_capacity(requests.len());
        for (data_type, _) in requests {
            if let Some(region) = self.pop_free(*data_type) {
                taken.push((region, false));
                continue;
            }
            match self.create_region(*data_type) {
                Ok(region) => taken.push((region, true)),
                Err(e) => {
                    self.push_free(taken.into_iter().map(|(region, _)| region).collect());
                    return Err(e);
                }
            }
        }

        for ((region, _), (_, owner)) in taken.iter().zip(requests) {
            if let Some(rec) = self.registry.regions.get_mut(&region.id) {
                rec.owner = Some(owner.clone());
            }
        }
        if let Err(e) = self.persist_registry() {
            for (region, _) in &taken {
                if let Some(rec) = self.registry.regions.get_mut(&region.id) {
                    rec.owner = None;
                }
            }
            self.push_free(taken.into_iter().map(|(region, _)| region).collect());
            return Err(e);
        }

        self.in_use += taken.len();
        Ok(taken)
    }

    /// Creates a region file and an unowned registry record for it. The record reaches disk with
    /// the next registry write.
    fn create_region(&mut self, data_type: DataType) -> Result<PmemRegion, BufferError> {
        let id = self.registry.next_region_id;
        let epoch = self.registry.epoch;
        let region = PmemRegion::create(
            &region_path(&self.dir, id),
            id,
            epoch,
            data_type,
            self.array_size,
            slot_width_of(data_type, self.text_slot_bytes),
        )?;
        self.registry.next_region_id += 1;
        self.registry.regions.insert(
            id,
            RegionRecord {
                id,
                data_type,
                epoch,
                owner: None,
            },
        );
        self.mapped_bytes += region.mapped_len() as u64;
        Ok(region)
    }

    /// Marks `series` as held by a new live list.
    ///
    /// Fails if a live list already holds it, or if regions of an earlier list are parked under
    /// it: those must be taken back with `TvList::recover`, not shadowed by fresh chunks.
    pub fn claim(&mut self, series: &SeriesKey) -> Result<(), BufferError> {
        if self.parked.contains_key(series) {
            return Err(BufferError::InvalidState(format!(
                "{} has parked persistent chunks; recover the list instead",
                series
            )));
        }
        self.claim_for_recovery(series)
    }

    /// Marks `series` as held by a list being recovered. Fails only if a live list holds it.
    pub fn claim_for_recovery(&mut self, series: &SeriesKey) -> Result<(), BufferError> {
        if !self.claimed.insert(series.clone()) {
            return Err(BufferError::InvalidState(format!(
                "{} is already held by a live persistent list",
                series
            )));
        }
        Ok(())
    }

    pub fn unclaim(&mut self, series: &SeriesKey) {
        self.claimed.remove(series);
    }

    pub fn is_claimed(&self, series: &SeriesKey) -> bool {
        self.claimed.contains(series)
    }

    /// Unbinds regions and makes them free for any list, in one registry write.
    pub fn release(&mut self, regions: Vec<PmemRegion>) -> Result<(), BufferError> {
        self.in_use = self.in_use.saturating_sub(regions.len());
        for region in &regions {
            if let Some(rec) = self.registry.regions.get_mut(&region.id) {
                rec.owner = None;
            }
        }
        let mut regions = regions;
        for region in regions.iter_mut() {
            region.set_committed(0);
        }
        self.push_free(regions);
        self.persist_registry()
    }

    /// Keeps regions bound to `series` without a live list attached.
    pub fn park(&mut self, series: &SeriesKey, regions: Vec<PmemRegion>) {
        self.in_use = self.in_use.saturating_sub(regions.len());
        self.parked.entry(series.clone()).or_default().extend(regions);
    }

    /// Hands out every region parked for `series`, with its owner record.
    pub fn take_parked(
        &mut self,
        series: &SeriesKey,
    ) -> Result<Vec<(ChunkOwner, PmemRegion)>, BufferError> {
        let regions = self.parked.remove(series).unwrap_or_default();
        let mut owned = Vec::with_capacity(regions.len());
        let mut orphan = None;
        for region in &regions {
            match self.registry.regions.get(&region.id).and_then(|r| r.owner.clone()) {
                Some(owner) => owned.push(owner),
                None => {
                    orphan = Some(region.id);
                    break;
                }
            }
        }
        if let Some(id) = orphan {
            self.parked.insert(series.clone(), regions);
            return Err(BufferError::corruption(
                format!("Parked region {} of {} has no owner record", id, series),
                Some(id),
            ));
        }
        self.in_use += regions.len();
        Ok(owned.into_iter().zip(regions).collect())
    }

    /// Series with parked regions and the element kind of their value chunks.
    pub fn parked_series(&self) -> Vec<(SeriesKey, DataType)> {
        let mut out: Vec<(SeriesKey, DataType)> = self
            .parked
            .iter()
            .filter_map(|(series, regions)| {
                regions.iter().find_map(|region| {
                    let rec = self.registry.regions.get(&region.id)?;
                    match rec.owner.as_ref()?.role {
                        ChunkRole::Value => Some((series.clone(), rec.data_type)),
                        ChunkRole::Timestamp => None,
                    }
                })
            })
            .collect();
        out.sort();
        out
    }

    fn pop_free(&mut self, data_type: DataType) -> Option<PmemRegion> {
        let current = (data_type, self.registry.epoch);
        if let Some(region) = self.free.get_mut(&current).and_then(Vec::pop) {
            return Some(region);
        }
        let key = self
            .free
            .range((data_type, 0)..=(data_type, u64::MAX))
            .find(|(_, regions)| !regions.is_empty())
            .map(|(k, _)| *k)?;
        self.free.get_mut(&key).and_then(Vec::pop)
    }

    fn push_free(&mut self, regions: Vec<PmemRegion>) {
        for region in regions {
            self.free
                .entry((region.data_type, region.epoch))
                .or_default()
                .push(region);
        }
    }

    fn persist_registry(&self) -> Result<(), BufferError> {
        write_registry_atomic(&self.dir.join(REGISTRY_FILE), &self.registry)
    }
}

fn region_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("region_{:020}.pmem", id))
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_registry(path: &Path) -> Result<Registry, BufferError> {
    let mut f = File::open(path)?;
    let mut magic = [0u8; 8];
    f.read_exact(&mut magic)?;
    if &magic != REGISTRY_MAGIC {
        return Err(BufferError::corruption(
            format!("Bad registry magic in {:?}", path),
            None,
        ));
    }
    let mut header = [0u8; 16];
    f.read_exact(&mut header)?;
    let version = read_u32(&header, 0);
    if version != REGISTRY_VERSION {
        return Err(BufferError::corruption(
            format!("Unsupported registry version {} in {:?}", version, path),
            None,
        ));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[4..12]);
    let len = u64::from_le_bytes(len_bytes) as usize;
    let crc = read_u32(&header, 12);

    let mut buf = vec![0u8; len];
    f.read_exact(&mut buf)?;
    let mut hasher = Crc32::new();
    hasher.update(&buf);
    if hasher.finalize() != crc {
        return Err(BufferError::corruption(
            format!("Registry CRC mismatch in {:?}", path),
            None,
        ));
    }
    bincode::deserialize(&buf).map_err(|e| BufferError::Serialization(e.to_string()))
}

fn write_registry_atomic(path: &Path, registry: &Registry) -> Result<(), BufferError> {
    let bytes = bincode::serialize(registry).map_err(|e| BufferError::Serialization(e.to_string()))?;
    let mut hasher = Crc32::new();
    hasher.update(&bytes);
    let crc = hasher.finalize();

    let tmp_path = path.with_extension("bin.tmp");
    let mut w = BufWriter::new(
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?,
    );
    w.write_all(REGISTRY_MAGIC)?;
    w.write_all(&REGISTRY_VERSION.to_le_bytes())?;
    w.write_all(&(bytes.len() as u64).to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(&bytes)?;
    w.flush()?;
    w.get_ref().sync_data()?;
    drop(w);

    fs::rename(&tmp_path, path)?;
    sync_parent_dir(path)?;
    Ok(())
}

fn sync_parent_dir(path: &Path) -> Result<(), BufferError> {
    let parent = path
        .parent()
        .ok_or_else(|| BufferError::Internal("Missing parent dir".to_string()))?;
    let dir = File::open(parent)?;
    dir.sync_data()?;
    Ok(())
}
