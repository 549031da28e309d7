//! Minimal FAT16/FAT32 editor for the Raspberry Pi boot partition.
//!
//! The customizer only ever touches files in the root directory
//! (`config.txt`, `cmdline.txt`, `firstrun.sh`, `user-data`,
//! `network-config`), so this module implements exactly that: BPB parsing,
//! FAT chain walking and allocation, and root-directory entries with long
//! filenames. FAT12 is rejected; Pi boot partitions are FAT16 or FAT32.

use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::customize::BootFiles;
use crate::partition::Mbr;

const DIR_ENTRY_SIZE: usize = 32;
const ATTR_READ_ONLY: u8 = 0x01;
const ATTR_HIDDEN: u8 = 0x02;
const ATTR_SYSTEM: u8 = 0x04;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_ARCHIVE: u8 = 0x20;
const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

// Fixed timestamp stamped into created entries (2021-01-01, midnight).
const FAT_EPOCH_DATE: u16 = ((2021 - 1980) << 9) | (1 << 5) | 1;

#[derive(Debug, Clone, Copy, PartialEq)]
enum FatType {
    Fat16,
    Fat32,
}

impl FatType {
    fn end_of_chain(&self) -> u32 {
        match self {
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }
}

/// An open FAT volume positioned at `partition_offset` within the device.
pub struct FatVolume<D> {
    dev: D,
    partition_offset: u64,
    bytes_per_sector: u64,
    sectors_per_cluster: u64,
    reserved_sectors: u64,
    num_fats: u8,
    sectors_per_fat: u64,
    root_entry_count: u16,
    root_cluster: u32,
    total_clusters: u64,
    fat_type: FatType,
}

/// Where the root directory lives on disk.
enum RootLocation {
    /// FAT16: fixed region after the FATs, fixed capacity.
    Fixed { offset: u64, size: usize },
    /// FAT32: cluster chain.
    Chain(Vec<u32>),
}

struct FoundEntry {
    /// Byte offset of the 8.3 entry within the root directory buffer.
    entry_offset: usize,
    /// Offset of the first LFN entry belonging to it (or the 8.3 entry).
    slot_offset: usize,
    start_cluster: u32,
    size: u32,
}

impl<D: Read + Write + Seek> FatVolume<D> {
    /// Open a FAT filesystem at the given offset within a device.
    pub fn open(mut dev: D, partition_offset: u64) -> Result<Self> {
        dev.seek(SeekFrom::Start(partition_offset))?;
        let mut bpb = [0u8; 512];
        dev.read_exact(&mut bpb)
            .context("cannot read FAT boot sector")?;

        // Validate jump instruction (EB xx 90 or E9 xx xx)
        if bpb[0] != 0xEB && bpb[0] != 0xE9 {
            bail!("invalid FAT boot sector: bad jump instruction");
        }

        let bytes_per_sector = LittleEndian::read_u16(&bpb[11..13]) as u64;
        if bytes_per_sector == 0 || bytes_per_sector > 4096 {
            bail!("invalid bytes per sector: {bytes_per_sector}");
        }
        let sectors_per_cluster = bpb[13] as u64;
        if sectors_per_cluster == 0 {
            bail!("invalid sectors per cluster: 0");
        }

        let reserved_sectors = LittleEndian::read_u16(&bpb[14..16]) as u64;
        let num_fats = bpb[16];
        let root_entry_count = LittleEndian::read_u16(&bpb[17..19]);

        let total_sectors_16 = LittleEndian::read_u16(&bpb[19..21]) as u64;
        let total_sectors_32 = LittleEndian::read_u32(&bpb[32..36]) as u64;
        let total_sectors = if total_sectors_16 != 0 {
            total_sectors_16
        } else {
            total_sectors_32
        };

        let sectors_per_fat_16 = LittleEndian::read_u16(&bpb[22..24]) as u64;
        let sectors_per_fat_32 = LittleEndian::read_u32(&bpb[36..40]) as u64;
        let sectors_per_fat = if sectors_per_fat_16 != 0 {
            sectors_per_fat_16
        } else {
            sectors_per_fat_32
        };

        let root_dir_sectors =
            ((root_entry_count as u64 * 32) + (bytes_per_sector - 1)) / bytes_per_sector;
        let data_start_sector =
            reserved_sectors + (num_fats as u64 * sectors_per_fat) + root_dir_sectors;
        let data_sectors = total_sectors.saturating_sub(data_start_sector);
        let total_clusters = data_sectors / sectors_per_cluster;

        // A zero 16-bit sectors-per-FAT with a zero root entry count marks a
        // FAT32 BPB regardless of the cluster-count thresholds.
        let fat_type = if sectors_per_fat_16 == 0 && root_entry_count == 0 {
            FatType::Fat32
        } else if total_clusters < 4085 {
            bail!("FAT12 volumes are not supported");
        } else if total_clusters < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        };

        let root_cluster = if fat_type == FatType::Fat32 {
            LittleEndian::read_u32(&bpb[44..48])
        } else {
            0
        };

        Ok(Self {
            dev,
            partition_offset,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            sectors_per_fat,
            root_entry_count,
            root_cluster,
            total_clusters,
            fat_type,
        })
    }

    /// Open the boot partition of a full-disk device: locate the first FAT
    /// partition through the MBR, falling back to treating the device itself
    /// as a FAT volume (a drive-letter target is already the partition).
    pub fn open_boot_partition(mut dev: D) -> Result<Self> {
        dev.seek(SeekFrom::Start(0))?;
        let mut sector = [0u8; 512];
        dev.read_exact(&mut sector)
            .context("cannot read device MBR")?;

        // A bare FAT volume carries the same 0xAA55 signature as an MBR, and
        // its boot code can masquerade as partition entries. Only follow the
        // table when an actual FAT boot sector sits at the claimed offset.
        let mut offset = 0;
        if let Ok(mbr) = Mbr::parse(&sector) {
            if let Some(part) = mbr.first_fat_partition() {
                let candidate = part.start_offset();
                if candidate > 0 && has_fat_boot_sector(&mut dev, candidate) {
                    offset = candidate;
                }
            }
        }
        Self::open(dev, offset)
    }

    fn sector_offset(&self, sector: u64) -> u64 {
        self.partition_offset + sector * self.bytes_per_sector
    }

    fn cluster_size(&self) -> u64 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        let root_dir_sectors = ((self.root_entry_count as u64 * 32)
            + (self.bytes_per_sector - 1))
            / self.bytes_per_sector;
        let data_start_sector = self.reserved_sectors
            + (self.num_fats as u64 * self.sectors_per_fat)
            + root_dir_sectors;
        let first_sector = data_start_sector + (cluster as u64 - 2) * self.sectors_per_cluster;
        self.sector_offset(first_sector)
    }

    fn fat_entry(&mut self, cluster: u32) -> Result<u32> {
        let fat_offset = self.sector_offset(self.reserved_sectors);
        match self.fat_type {
            FatType::Fat16 => {
                self.dev
                    .seek(SeekFrom::Start(fat_offset + cluster as u64 * 2))?;
                let mut buf = [0u8; 2];
                self.dev.read_exact(&mut buf)?;
                Ok(LittleEndian::read_u16(&buf) as u32)
            }
            FatType::Fat32 => {
                self.dev
                    .seek(SeekFrom::Start(fat_offset + cluster as u64 * 4))?;
                let mut buf = [0u8; 4];
                self.dev.read_exact(&mut buf)?;
                Ok(LittleEndian::read_u32(&buf) & 0x0FFF_FFFF)
            }
        }
    }

    /// Write a FAT entry into every FAT copy.
    fn set_fat_entry(&mut self, cluster: u32, value: u32) -> Result<()> {
        let fat_bytes = self.sectors_per_fat * self.bytes_per_sector;
        for copy in 0..self.num_fats as u64 {
            let base = self.sector_offset(self.reserved_sectors) + copy * fat_bytes;
            match self.fat_type {
                FatType::Fat16 => {
                    self.dev.seek(SeekFrom::Start(base + cluster as u64 * 2))?;
                    self.dev.write_all(&(value as u16).to_le_bytes())?;
                }
                FatType::Fat32 => {
                    // Preserve the reserved top nibble.
                    self.dev.seek(SeekFrom::Start(base + cluster as u64 * 4))?;
                    let mut buf = [0u8; 4];
                    self.dev.read_exact(&mut buf)?;
                    let old = LittleEndian::read_u32(&buf);
                    let merged = (old & 0xF000_0000) | (value & 0x0FFF_FFFF);
                    self.dev.seek(SeekFrom::Start(base + cluster as u64 * 4))?;
                    self.dev.write_all(&merged.to_le_bytes())?;
                }
            }
        }
        Ok(())
    }

    fn next_cluster(&mut self, cluster: u32) -> Result<Option<u32>> {
        let entry = self.fat_entry(cluster)?;
        let next = match self.fat_type {
            FatType::Fat16 => {
                if entry >= 0xFFF8 || entry == 0 || entry >= 0xFFF0 {
                    None
                } else {
                    Some(entry)
                }
            }
            FatType::Fat32 => {
                if entry >= 0x0FFF_FFF8 || entry < 2 || entry >= 0x0FFF_FFF0 {
                    None
                } else {
                    Some(entry)
                }
            }
        };
        Ok(next)
    }

    /// Follow a chain from `start`, bounded by the cluster count.
    fn chain(&mut self, start: u32) -> Result<Vec<u32>> {
        let mut clusters = Vec::new();
        let mut cluster = start;
        while cluster >= 2 && clusters.len() <= self.total_clusters as usize {
            clusters.push(cluster);
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => break,
            }
        }
        Ok(clusters)
    }

    fn free_chain(&mut self, start: u32) -> Result<()> {
        for cluster in self.chain(start)? {
            self.set_fat_entry(cluster, 0)?;
        }
        Ok(())
    }

    /// Allocate and link `count` free clusters, returning the new chain.
    fn allocate_chain(&mut self, count: usize) -> Result<Vec<u32>> {
        let mut clusters = Vec::with_capacity(count);
        let highest = self.total_clusters as u32 + 1;
        let mut candidate = 2u32;
        while clusters.len() < count && candidate <= highest {
            if self.fat_entry(candidate)? == 0 {
                clusters.push(candidate);
            }
            candidate += 1;
        }
        if clusters.len() < count {
            bail!("no space left on FAT volume");
        }
        for pair in clusters.windows(2) {
            self.set_fat_entry(pair[0], pair[1])?;
        }
        let eoc = self.fat_type.end_of_chain();
        self.set_fat_entry(*clusters.last().expect("count > 0"), eoc)?;
        Ok(clusters)
    }

    fn read_cluster_chain(&mut self, start: u32) -> Result<Vec<u8>> {
        let cluster_size = self.cluster_size() as usize;
        let chain = self.chain(start)?;
        let mut data = Vec::with_capacity(chain.len() * cluster_size);
        for cluster in chain {
            let offset = self.cluster_offset(cluster);
            self.dev.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; cluster_size];
            self.dev.read_exact(&mut buf)?;
            data.extend_from_slice(&buf);
        }
        Ok(data)
    }

    fn load_root(&mut self) -> Result<(Vec<u8>, RootLocation)> {
        match self.fat_type {
            FatType::Fat16 => {
                let root_start =
                    self.reserved_sectors + (self.num_fats as u64 * self.sectors_per_fat);
                let size = self.root_entry_count as usize * DIR_ENTRY_SIZE;
                let offset = self.sector_offset(root_start);
                self.dev.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; size];
                self.dev.read_exact(&mut buf)?;
                Ok((buf, RootLocation::Fixed { offset, size }))
            }
            FatType::Fat32 => {
                let chain = self.chain(self.root_cluster)?;
                let data = self.read_cluster_chain(self.root_cluster)?;
                Ok((data, RootLocation::Chain(chain)))
            }
        }
    }

    fn store_root(&mut self, data: &[u8], location: RootLocation) -> Result<()> {
        match location {
            RootLocation::Fixed { offset, size } => {
                if data.len() > size {
                    bail!("root directory is full");
                }
                self.dev.seek(SeekFrom::Start(offset))?;
                self.dev.write_all(data)?;
                Ok(())
            }
            RootLocation::Chain(mut chain) => {
                let cluster_size = self.cluster_size() as usize;
                let needed = data.len().div_ceil(cluster_size);
                if needed > chain.len() {
                    let extra = self.allocate_chain(needed - chain.len())?;
                    let last = *chain.last().context("root chain is empty")?;
                    self.set_fat_entry(last, extra[0])?;
                    chain.extend_from_slice(&extra);
                }
                for (i, cluster) in chain.iter().enumerate().take(needed) {
                    let start = i * cluster_size;
                    let end = ((i + 1) * cluster_size).min(data.len());
                    let mut buf = vec![0u8; cluster_size];
                    buf[..end - start].copy_from_slice(&data[start..end]);
                    let offset = self.cluster_offset(*cluster);
                    self.dev.seek(SeekFrom::Start(offset))?;
                    self.dev.write_all(&buf)?;
                }
                Ok(())
            }
        }
    }

    /// Locate a root-directory file by name (long or short, case-insensitive).
    fn find_entry(&self, root: &[u8], name: &str) -> Option<FoundEntry> {
        let wanted = name.to_ascii_lowercase();
        let mut lfn_parts: Vec<(u8, String)> = Vec::new();
        let mut lfn_start: Option<usize> = None;

        for off in (0..root.len()).step_by(DIR_ENTRY_SIZE) {
            let entry = &root[off..off + DIR_ENTRY_SIZE];
            if entry[0] == 0x00 {
                break;
            }
            if entry[0] == 0xE5 {
                lfn_parts.clear();
                lfn_start = None;
                continue;
            }

            let attr = entry[11];
            if attr == ATTR_LONG_NAME {
                if entry[0] & 0x40 != 0 {
                    lfn_parts.clear();
                    lfn_start = Some(off);
                }
                lfn_parts.push((entry[0] & 0x3F, decode_lfn_part(entry)));
                continue;
            }
            if attr & ATTR_VOLUME_ID != 0 || attr & ATTR_DIRECTORY != 0 {
                lfn_parts.clear();
                lfn_start = None;
                continue;
            }

            let short_name = build_short_name(&entry[0..8], &entry[8..11]);
            let long_name = if !lfn_parts.is_empty() {
                lfn_parts.sort_by_key(|&(seq, _)| seq);
                lfn_parts.iter().map(|(_, s)| s.as_str()).collect::<String>()
            } else {
                String::new()
            };

            let matches = long_name.to_ascii_lowercase() == wanted
                || short_name.to_ascii_lowercase() == wanted;
            if matches {
                let cluster_hi = LittleEndian::read_u16(&entry[20..22]) as u32;
                let cluster_lo = LittleEndian::read_u16(&entry[26..28]) as u32;
                let start_cluster = match self.fat_type {
                    FatType::Fat16 => cluster_lo,
                    FatType::Fat32 => (cluster_hi << 16) | cluster_lo,
                };
                return Some(FoundEntry {
                    entry_offset: off,
                    slot_offset: if long_name.is_empty() {
                        off
                    } else {
                        lfn_start.unwrap_or(off)
                    },
                    start_cluster,
                    size: LittleEndian::read_u32(&entry[28..32]),
                });
            }

            lfn_parts.clear();
            lfn_start = None;
        }
        None
    }

    /// Collect every short name in the root, for alias collision checks.
    fn short_names(&self, root: &[u8]) -> Vec<[u8; 11]> {
        let mut names = Vec::new();
        for off in (0..root.len()).step_by(DIR_ENTRY_SIZE) {
            let entry = &root[off..off + DIR_ENTRY_SIZE];
            if entry[0] == 0x00 {
                break;
            }
            if entry[0] == 0xE5 || entry[11] == ATTR_LONG_NAME {
                continue;
            }
            let mut name = [0u8; 11];
            name.copy_from_slice(&entry[0..11]);
            names.push(name);
        }
        names
    }

    /// Remove a file's directory entries (LFN run plus the 8.3 entry).
    fn delete_entry(root: &mut [u8], found: &FoundEntry) {
        let mut off = found.slot_offset;
        while off <= found.entry_offset {
            root[off] = 0xE5;
            off += DIR_ENTRY_SIZE;
        }
    }

    /// Insert directory entries for `name`, returning the updated buffer.
    fn insert_entry(
        &self,
        root: &mut Vec<u8>,
        name: &str,
        start_cluster: u32,
        size: u32,
    ) -> Result<()> {
        let short = make_short_alias(name, &self.short_names(root));
        let lfn_entries = build_lfn_entries(name, &short);
        let slots_needed = lfn_entries.len() + 1;

        let mut slot = find_free_run(root, slots_needed);
        if slot.is_none() {
            match self.fat_type {
                FatType::Fat16 => bail!("root directory is full"),
                FatType::Fat32 => {
                    // Grow the buffer; store_root extends the chain to match.
                    let grow = self.cluster_size() as usize;
                    root.resize(root.len() + grow, 0);
                    slot = find_free_run(root, slots_needed);
                }
            }
        }
        let slot = slot.context("no free directory slots")?;
        let consumed_terminator = root[slot..slot + slots_needed * DIR_ENTRY_SIZE]
            .iter()
            .step_by(DIR_ENTRY_SIZE)
            .any(|&b| b == 0x00);

        let mut off = slot;
        for entry in &lfn_entries {
            root[off..off + DIR_ENTRY_SIZE].copy_from_slice(entry);
            off += DIR_ENTRY_SIZE;
        }

        let entry = &mut root[off..off + DIR_ENTRY_SIZE];
        entry.fill(0);
        entry[0..11].copy_from_slice(&short);
        entry[11] = ATTR_ARCHIVE;
        LittleEndian::write_u16(&mut entry[16..18], FAT_EPOCH_DATE);
        LittleEndian::write_u16(&mut entry[18..20], FAT_EPOCH_DATE);
        LittleEndian::write_u16(&mut entry[24..26], FAT_EPOCH_DATE);
        if self.fat_type == FatType::Fat32 {
            LittleEndian::write_u16(&mut entry[20..22], (start_cluster >> 16) as u16);
        }
        LittleEndian::write_u16(&mut entry[26..28], (start_cluster & 0xFFFF) as u16);
        LittleEndian::write_u32(&mut entry[28..32], size);

        // If the run swallowed the end-of-directory marker, everything past
        // the new entry is undefined; re-terminate the directory.
        let next = off + DIR_ENTRY_SIZE;
        if consumed_terminator && next + DIR_ENTRY_SIZE <= root.len() && root[next] != 0x00 {
            root[next..next + DIR_ENTRY_SIZE].fill(0);
        }
        Ok(())
    }

    /// Read a root-directory file in full.
    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>> {
        let (root, _) = self.load_root()?;
        let found = self
            .find_entry(&root, name)
            .with_context(|| format!("{name} not found on boot partition"))?;
        if found.size == 0 || found.start_cluster < 2 {
            return Ok(Vec::new());
        }
        let mut data = self.read_cluster_chain(found.start_cluster)?;
        data.truncate(found.size as usize);
        Ok(data)
    }

    /// Create or replace a root-directory file.
    pub fn write_file(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let (mut root, location) = self.load_root()?;

        if let Some(found) = self.find_entry(&root, name) {
            if found.start_cluster >= 2 {
                self.free_chain(found.start_cluster)?;
            }
            Self::delete_entry(&mut root, &found);
        }

        let start_cluster = if data.is_empty() {
            0
        } else {
            let cluster_size = self.cluster_size() as usize;
            let chain = self.allocate_chain(data.len().div_ceil(cluster_size))?;
            for (i, cluster) in chain.iter().enumerate() {
                let start = i * cluster_size;
                let end = ((i + 1) * cluster_size).min(data.len());
                let mut buf = vec![0u8; cluster_size];
                buf[..end - start].copy_from_slice(&data[start..end]);
                let offset = self.cluster_offset(*cluster);
                self.dev.seek(SeekFrom::Start(offset))?;
                self.dev.write_all(&buf)?;
            }
            chain[0]
        };

        self.insert_entry(&mut root, name, start_cluster, data.len() as u32)?;
        self.store_root(&root, location)?;
        Ok(())
    }

    /// Whether a root-directory file exists.
    pub fn has_file(&mut self, name: &str) -> Result<bool> {
        let (root, _) = self.load_root()?;
        Ok(self.find_entry(&root, name).is_some())
    }

    /// Flush pending writes to the device.
    pub fn sync(&mut self) -> Result<()> {
        self.dev.flush()?;
        Ok(())
    }
}

impl<D: Read + Write + Seek + Send> BootFiles for FatVolume<D> {
    fn exists(&mut self, name: &str) -> Result<bool> {
        self.has_file(name)
    }

    fn read(&mut self, name: &str) -> Result<Vec<u8>> {
        self.read_file(name)
    }

    fn write(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.write_file(name, data)
    }

    fn sync(&mut self) -> Result<()> {
        FatVolume::sync(self)
    }
}

/// Whether `offset` holds something shaped like a FAT boot sector.
fn has_fat_boot_sector<D: Read + Seek>(dev: &mut D, offset: u64) -> bool {
    let mut bpb = [0u8; 512];
    if dev.seek(SeekFrom::Start(offset)).is_err() || dev.read_exact(&mut bpb).is_err() {
        return false;
    }
    let jump_ok = bpb[0] == 0xEB || bpb[0] == 0xE9;
    let signature_ok = bpb[510] == 0x55 && bpb[511] == 0xAA;
    jump_ok && signature_ok
}

fn decode_lfn_part(entry: &[u8]) -> String {
    // LFN entry layout (13 UTF-16LE characters per entry):
    //   Bytes 1-10:  characters 1-5
    //   Bytes 14-25: characters 6-11
    //   Bytes 28-31: characters 12-13
    let positions = [
        1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30,
    ];
    positions
        .iter()
        .map(|&p| u16::from_le_bytes([entry[p], entry[p + 1]]))
        .take_while(|&c| c != 0x0000 && c != 0xFFFF)
        .flat_map(|c| char::from_u32(c as u32))
        .collect()
}

fn build_short_name(name_bytes: &[u8], ext_bytes: &[u8]) -> String {
    let name = String::from_utf8_lossy(name_bytes).trim_end().to_string();
    let ext = String::from_utf8_lossy(ext_bytes).trim_end().to_string();
    if ext.is_empty() {
        name
    } else {
        format!("{name}.{ext}")
    }
}

/// Checksum of an 8.3 name, stored in every LFN entry that points at it.
fn short_name_checksum(short: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &byte in short {
        sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(byte);
    }
    sum
}

/// Derive a unique 8.3 alias for `name`.
fn make_short_alias(name: &str, existing: &[[u8; 11]]) -> [u8; 11] {
    let (base, ext) = match name.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() => (base, ext),
        _ => (name, ""),
    };

    let sanitize = |s: &str, max: usize| -> Vec<u8> {
        s.chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase() as u8)
            .take(max)
            .collect()
    };

    let base_fits = base.len() <= 8
        && base.chars().all(|c| c.is_ascii_alphanumeric())
        && ext.len() <= 3
        && ext.chars().all(|c| c.is_ascii_alphanumeric());

    let mut short = [b' '; 11];
    let ext_part = sanitize(ext, 3);
    short[8..8 + ext_part.len()].copy_from_slice(&ext_part);

    if base_fits {
        let base_part = sanitize(base, 8);
        short[..base_part.len()].copy_from_slice(&base_part);
        if !existing.contains(&short) {
            return short;
        }
    }

    // Tilde alias: BASENA~N.EXT
    let stem = sanitize(base, 6);
    for n in 1..=9u8 {
        let mut candidate = [b' '; 11];
        candidate[..stem.len()].copy_from_slice(&stem);
        candidate[stem.len()] = b'~';
        candidate[stem.len() + 1] = b'0' + n;
        candidate[8..8 + ext_part.len()].copy_from_slice(&ext_part);
        if !existing.contains(&candidate) {
            return candidate;
        }
    }
    // Nine collisions on a boot partition will not happen in practice.
    short
}

/// Build the LFN entries for `name`, in physical (reversed) order.
fn build_lfn_entries(name: &str, short: &[u8; 11]) -> Vec<[u8; DIR_ENTRY_SIZE]> {
    let checksum = short_name_checksum(short);
    let mut units: Vec<u16> = name.encode_utf16().collect();
    units.push(0x0000);
    while units.len() % 13 != 0 {
        units.push(0xFFFF);
    }

    let count = units.len() / 13;
    let positions = [
        1usize, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30,
    ];

    let mut entries = Vec::with_capacity(count);
    for seq in (1..=count).rev() {
        let chunk = &units[(seq - 1) * 13..seq * 13];
        let mut entry = [0u8; DIR_ENTRY_SIZE];
        entry[0] = seq as u8 | if seq == count { 0x40 } else { 0 };
        entry[11] = ATTR_LONG_NAME;
        entry[13] = checksum;
        for (i, &pos) in positions.iter().enumerate() {
            entry[pos..pos + 2].copy_from_slice(&chunk[i].to_le_bytes());
        }
        entries.push(entry);
    }
    entries
}

/// Find `count` consecutive free directory slots.
fn find_free_run(root: &[u8], count: usize) -> Option<usize> {
    let mut run_start = None;
    let mut run_len = 0;
    for off in (0..root.len()).step_by(DIR_ENTRY_SIZE) {
        if off + DIR_ENTRY_SIZE > root.len() {
            break;
        }
        let first = root[off];
        if first == 0x00 || first == 0xE5 {
            if run_start.is_none() {
                run_start = Some(off);
            }
            run_len += 1;
            if run_len == count {
                return run_start;
            }
        } else {
            run_start = None;
            run_len = 0;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Build a small in-memory FAT16 volume: 512-byte sectors, one sector
    /// per cluster, one FAT copy mirrored twice, 512 root entries.
    fn mkfat16() -> Cursor<Vec<u8>> {
        let bytes_per_sector = 512u16;
        let reserved = 1u16;
        let num_fats = 2u8;
        let sectors_per_fat = 32u16;
        let root_entries = 512u16;
        let total_sectors = 8192u16; // enough clusters to classify as FAT16

        let mut img = vec![0u8; total_sectors as usize * bytes_per_sector as usize];
        img[0] = 0xEB;
        img[2] = 0x90;
        img[11..13].copy_from_slice(&bytes_per_sector.to_le_bytes());
        img[13] = 1; // sectors per cluster
        img[14..16].copy_from_slice(&reserved.to_le_bytes());
        img[16] = num_fats;
        img[17..19].copy_from_slice(&root_entries.to_le_bytes());
        img[19..21].copy_from_slice(&total_sectors.to_le_bytes());
        img[22..24].copy_from_slice(&sectors_per_fat.to_le_bytes());
        img[510] = 0x55;
        img[511] = 0xAA;

        // Reserve clusters 0 and 1 in both FAT copies.
        for copy in 0..num_fats as usize {
            let base = (reserved as usize + copy * sectors_per_fat as usize)
                * bytes_per_sector as usize;
            img[base..base + 2].copy_from_slice(&0xFFF8u16.to_le_bytes());
            img[base + 2..base + 4].copy_from_slice(&0xFFFFu16.to_le_bytes());
        }

        Cursor::new(img)
    }

    #[test]
    fn create_and_read_back() {
        let mut vol = FatVolume::open(mkfat16(), 0).unwrap();
        vol.write_file("config.txt", b"arm_64bit=1\n").unwrap();
        assert!(vol.has_file("config.txt").unwrap());
        assert_eq!(vol.read_file("config.txt").unwrap(), b"arm_64bit=1\n");
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut vol = FatVolume::open(mkfat16(), 0).unwrap();
        vol.write_file("cmdline.txt", b"console=serial0\n").unwrap();
        assert!(vol.has_file("CMDLINE.TXT").unwrap());
    }

    #[test]
    fn long_name_round_trips() {
        let mut vol = FatVolume::open(mkfat16(), 0).unwrap();
        vol.write_file("network-config", b"version: 2\n").unwrap();
        assert!(vol.has_file("network-config").unwrap());
        assert_eq!(vol.read_file("network-config").unwrap(), b"version: 2\n");
        // Name without an extension and longer than eight characters.
        vol.write_file("user-data", b"#cloud-config\n").unwrap();
        assert_eq!(vol.read_file("user-data").unwrap(), b"#cloud-config\n");
    }

    #[test]
    fn overwrite_grows_and_shrinks() {
        let mut vol = FatVolume::open(mkfat16(), 0).unwrap();
        let big = vec![b'x'; 2000]; // spans multiple 512-byte clusters
        vol.write_file("firstrun.sh", &big).unwrap();
        assert_eq!(vol.read_file("firstrun.sh").unwrap(), big);

        vol.write_file("firstrun.sh", b"#!/bin/sh\n").unwrap();
        assert_eq!(vol.read_file("firstrun.sh").unwrap(), b"#!/bin/sh\n");
    }

    #[test]
    fn missing_file_reports_absent() {
        let mut vol = FatVolume::open(mkfat16(), 0).unwrap();
        assert!(!vol.has_file("user-data").unwrap());
        assert!(vol.read_file("user-data").is_err());
    }

    #[test]
    fn empty_file_has_no_clusters() {
        let mut vol = FatVolume::open(mkfat16(), 0).unwrap();
        vol.write_file("ssh", b"").unwrap();
        assert!(vol.has_file("ssh").unwrap());
        assert_eq!(vol.read_file("ssh").unwrap(), b"");
    }

    #[test]
    fn open_boot_partition_follows_the_mbr() {
        // Embed the FAT16 volume at LBA 2048 behind a real partition table.
        let volume = mkfat16().into_inner();
        let offset = 2048 * 512;
        let mut disk = vec![0u8; offset + volume.len()];
        disk[446 + 4] = 0x06; // FAT16
        disk[446 + 8..446 + 12].copy_from_slice(&2048u32.to_le_bytes());
        disk[446 + 12..446 + 16].copy_from_slice(&8192u32.to_le_bytes());
        disk[510] = 0x55;
        disk[511] = 0xAA;
        disk[offset..].copy_from_slice(&volume);

        let mut vol = FatVolume::open_boot_partition(Cursor::new(disk)).unwrap();
        vol.write_file("config.txt", b"dtparam=audio=on\n").unwrap();
        assert_eq!(vol.read_file("config.txt").unwrap(), b"dtparam=audio=on\n");
    }

    #[test]
    fn open_boot_partition_accepts_a_bare_volume() {
        let mut vol = FatVolume::open_boot_partition(mkfat16()).unwrap();
        vol.write_file("ssh", b"").unwrap();
        assert!(vol.has_file("ssh").unwrap());
    }

    #[test]
    fn short_alias_generation() {
        let alias = make_short_alias("user-data", &[]);
        assert_eq!(&alias[..8], b"USERDA~1");
        let alias = make_short_alias("config.txt", &[]);
        assert_eq!(&alias, b"CONFIG  TXT");
    }

    #[test]
    fn checksum_matches_reference() {
        // Reference value for "README  TXT" computed with the standard
        // rotate-and-add algorithm.
        let mut short = [b' '; 11];
        short[..6].copy_from_slice(b"README");
        short[8..11].copy_from_slice(b"TXT");
        let sum = short_name_checksum(&short);
        let mut expected: u8 = 0;
        for &b in &short {
            expected = ((expected & 1) << 7)
                .wrapping_add(expected >> 1)
                .wrapping_add(b);
        }
        assert_eq!(sum, expected);
    }
}
