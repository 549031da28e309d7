use byteorder::{ByteOrder, LittleEndian};

use crate::error::ImagerError;

const MBR_SIGNATURE: u16 = 0xAA55;
const PARTITION_TABLE_OFFSET: usize = 446;
const PARTITION_ENTRY_SIZE: usize = 16;

/// A single MBR partition table entry.
#[derive(Debug, Clone, Copy)]
pub struct MbrPartitionEntry {
    pub bootable: bool,
    pub partition_type: u8,
    pub start_lba: u32,
    pub total_sectors: u32,
}

impl MbrPartitionEntry {
    fn parse(data: &[u8]) -> Self {
        Self {
            bootable: data[0] == 0x80,
            partition_type: data[4],
            start_lba: LittleEndian::read_u32(&data[8..12]),
            total_sectors: LittleEndian::read_u32(&data[12..16]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.partition_type == 0x00 && self.start_lba == 0 && self.total_sectors == 0
    }

    /// True for the partition types a FAT boot partition can carry.
    pub fn is_fat(&self) -> bool {
        matches!(
            self.partition_type,
            0x01 | 0x04 | 0x06 | 0x0B | 0x0C | 0x0E | 0x11 | 0x14 | 0x16 | 0x1B | 0x1C | 0x1E
        )
    }

    /// Byte offset of the partition from the start of the disk.
    pub fn start_offset(&self) -> u64 {
        self.start_lba as u64 * 512
    }
}

/// Parsed MBR (Master Boot Record).
#[derive(Debug, Clone)]
pub struct Mbr {
    pub entries: [MbrPartitionEntry; 4],
}

impl Mbr {
    /// Parse an MBR from exactly 512 bytes.
    pub fn parse(data: &[u8; 512]) -> Result<Self, ImagerError> {
        let signature = LittleEndian::read_u16(&data[510..512]);
        if signature != MBR_SIGNATURE {
            return Err(ImagerError::InvalidMbr(format!(
                "bad boot signature 0x{signature:04X}"
            )));
        }

        let mut entries = [MbrPartitionEntry {
            bootable: false,
            partition_type: 0,
            start_lba: 0,
            total_sectors: 0,
        }; 4];
        for (i, entry) in entries.iter_mut().enumerate() {
            let off = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
            *entry = MbrPartitionEntry::parse(&data[off..off + PARTITION_ENTRY_SIZE]);
        }

        Ok(Self { entries })
    }

    /// The first FAT partition, which on a Raspberry Pi image is the boot
    /// partition the customizer edits.
    pub fn first_fat_partition(&self) -> Option<&MbrPartitionEntry> {
        self.entries.iter().find(|e| !e.is_empty() && e.is_fat())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mbr() -> [u8; 512] {
        let mut data = [0u8; 512];
        data[510] = 0x55;
        data[511] = 0xAA;
        // Entry 0: FAT32 (LBA) at LBA 8192, 1 MiB worth of sectors.
        let e0 = PARTITION_TABLE_OFFSET;
        data[e0 + 4] = 0x0C;
        data[e0 + 8..e0 + 12].copy_from_slice(&8192u32.to_le_bytes());
        data[e0 + 12..e0 + 16].copy_from_slice(&2048u32.to_le_bytes());
        // Entry 1: Linux at LBA 532480.
        let e1 = e0 + PARTITION_ENTRY_SIZE;
        data[e1 + 4] = 0x83;
        data[e1 + 8..e1 + 12].copy_from_slice(&532480u32.to_le_bytes());
        data[e1 + 12..e1 + 16].copy_from_slice(&4096u32.to_le_bytes());
        data
    }

    #[test]
    fn parses_partition_table() {
        let mbr = Mbr::parse(&sample_mbr()).unwrap();
        assert_eq!(mbr.entries[0].partition_type, 0x0C);
        assert_eq!(mbr.entries[0].start_lba, 8192);
        assert_eq!(mbr.entries[1].partition_type, 0x83);
        assert!(mbr.entries[2].is_empty());
    }

    #[test]
    fn finds_fat_boot_partition() {
        let mbr = Mbr::parse(&sample_mbr()).unwrap();
        let boot = mbr.first_fat_partition().unwrap();
        assert_eq!(boot.start_offset(), 8192 * 512);
    }

    #[test]
    fn rejects_missing_signature() {
        let data = [0u8; 512];
        assert!(matches!(
            Mbr::parse(&data),
            Err(ImagerError::InvalidMbr(_))
        ));
    }
}
