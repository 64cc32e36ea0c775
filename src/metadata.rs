//! Per-file metadata: paths, chunk offsets and the map-id bitmap.
//!
//! A [`FileInfo`] is created when a slot is reserved and mutated only by
//! its owning writer until close, after which it is effectively frozen and
//! published to the commit coordinator. Chunk offsets are the byte
//! positions at which a reader may begin a fetch; on a distributed
//! filesystem they are also serialised into a sidecar index file.

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt};
use parking_lot::Mutex;
use roaring::RoaringBitmap;

/// Which kind of backing store holds the partition file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    LocalDisk,
    DistributedFs,
}

/// Suffix of the zero-byte marker advertising a readable DFS partition.
pub const SUCCESS_SUFFIX: &str = ".success";

/// Suffix of the DFS sidecar carrying the chunk-offset table.
pub const INDEX_SUFFIX: &str = ".index";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Metadata for one partition file.
#[derive(Debug)]
pub struct FileInfo {
    kind: StoreKind,
    file_path: PathBuf,
    success_path: PathBuf,
    index_path: PathBuf,
    /// Success marker of the peer replica, when DFS replication is in play.
    peer_success_path: Option<PathBuf>,
    chunk_offsets: Mutex<Vec<u64>>,
    map_ids: Mutex<RoaringBitmap>,
}

impl FileInfo {
    /// Metadata for a file on a local mount.
    pub fn local(file_path: impl Into<PathBuf>) -> Self {
        Self::new(StoreKind::LocalDisk, file_path.into(), None)
    }

    /// Metadata for a file on the distributed filesystem. `peer_success`
    /// is the success marker the replica peer would write; its presence at
    /// close time means the peer won the replication race.
    pub fn distributed(file_path: impl Into<PathBuf>, peer_success: Option<PathBuf>) -> Self {
        Self::new(StoreKind::DistributedFs, file_path.into(), peer_success)
    }

    fn new(kind: StoreKind, file_path: PathBuf, peer_success_path: Option<PathBuf>) -> Self {
        let success_path = with_suffix(&file_path, SUCCESS_SUFFIX);
        let index_path = with_suffix(&file_path, INDEX_SUFFIX);
        Self {
            kind,
            file_path,
            success_path,
            index_path,
            peer_success_path,
            chunk_offsets: Mutex::new(Vec::new()),
            map_ids: Mutex::new(RoaringBitmap::new()),
        }
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn success_path(&self) -> &Path {
        &self.success_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn peer_success_path(&self) -> Option<&Path> {
        self.peer_success_path.as_deref()
    }

    /// Record a chunk boundary. Offsets must arrive non-decreasing; the
    /// writer's boundary rule guarantees this.
    pub fn add_chunk_offset(&self, offset: u64) {
        self.chunk_offsets.lock().push(offset);
    }

    pub fn last_chunk_offset(&self) -> Option<u64> {
        self.chunk_offsets.lock().last().copied()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_offsets.lock().len()
    }

    /// Snapshot of the offset list.
    pub fn chunk_offsets(&self) -> Vec<u64> {
        self.chunk_offsets.lock().clone()
    }

    /// Note a producer id seen by the range-read filter.
    pub fn record_map_id(&self, map_id: u32) {
        self.map_ids.lock().insert(map_id);
    }

    /// The map ids seen so far, or `None` when the filter recorded nothing.
    pub fn map_id_bitmap(&self) -> Option<RoaringBitmap> {
        let ids = self.map_ids.lock();
        if ids.is_empty() { None } else { Some(ids.clone()) }
    }
}

/// Serialise a chunk-offset table into the on-disk index format: a 4-byte
/// big-endian count followed by one 8-byte big-endian offset per chunk.
pub fn encode_chunk_index(offsets: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + offsets.len() * 8);
    out.extend_from_slice(&(offsets.len() as i32).to_be_bytes());
    for &offset in offsets {
        out.extend_from_slice(&(offset as i64).to_be_bytes());
    }
    out
}

/// Parse an index file produced by [`encode_chunk_index`].
pub fn decode_chunk_index(mut input: impl Read) -> io::Result<Vec<u64>> {
    let count = input.read_i32::<BigEndian>()?;
    if count < 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("negative chunk count {count} in index"),
        ));
    }
    let mut offsets = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let offset = input.read_i64::<BigEndian>()?;
        if offset < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("negative chunk offset {offset} in index"),
            ));
        }
        offsets.push(offset as u64);
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn derived_paths_append_suffixes() {
        let info = FileInfo::local("/mnt/disk1/app-1/0/3-0");
        assert_eq!(info.success_path(), Path::new("/mnt/disk1/app-1/0/3-0.success"));
        assert_eq!(info.index_path(), Path::new("/mnt/disk1/app-1/0/3-0.index"));
        assert_eq!(info.peer_success_path(), None);
    }

    #[test]
    fn chunk_offsets_snapshot_in_insertion_order() {
        let info = FileInfo::local("/tmp/f");
        info.add_chunk_offset(3000);
        info.add_chunk_offset(4000);
        assert_eq!(info.chunk_offsets(), vec![3000, 4000]);
        assert_eq!(info.last_chunk_offset(), Some(4000));
        assert_eq!(info.chunk_count(), 2);
    }

    #[test]
    fn map_id_bitmap_is_none_until_recorded() {
        let info = FileInfo::local("/tmp/f");
        assert!(info.map_id_bitmap().is_none());
        info.record_map_id(7);
        info.record_map_id(7);
        info.record_map_id(9);
        let bitmap = info.map_id_bitmap().expect("ids recorded");
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![7, 9]);
    }

    #[test]
    fn index_layout_is_big_endian() {
        let encoded = encode_chunk_index(&[256]);
        assert_eq!(encoded[..4], [0, 0, 0, 1]);
        assert_eq!(encoded[4..], [0, 0, 0, 0, 0, 0, 1, 0]);
    }

    #[test]
    fn decode_rejects_negative_count() {
        let mut bad = Vec::new();
        bad.extend_from_slice(&(-1i32).to_be_bytes());
        assert!(decode_chunk_index(bad.as_slice()).is_err());
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let encoded = encode_chunk_index(&[100, 200]);
        assert!(decode_chunk_index(&encoded[..encoded.len() - 1]).is_err());
    }

    proptest! {
        #[test]
        fn index_round_trips(offsets in proptest::collection::vec(0u64..=i64::MAX as u64, 0..64)) {
            let encoded = encode_chunk_index(&offsets);
            let decoded = decode_chunk_index(encoded.as_slice()).expect("valid index");
            prop_assert_eq!(decoded, offsets);
        }
    }
}
