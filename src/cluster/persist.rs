//! Durable topology records using RocksDB
//!
//! One record per collection, rewritten on every committed revision:
//!
//! ```text
//! ┌──────────────┬─────────────────────────────┐
//! │ crc32 (LE u32)│ bincode(ClusterTopology)   │
//! └──────────────┴─────────────────────────────┘
//! ```

use crate::cluster::ClusterTopology;
use crate::common::{Error, Result};
use rocksdb::{ColumnFamily, IteratorMode, Options, WriteOptions, DB};
use std::path::Path;

const CF_TOPOLOGY: &str = "topology";

/// A record read back at startup
#[derive(Debug)]
pub enum StoredTopology {
    Valid(ClusterTopology),
    /// Checksum or decoding failed; the collection must not be mutated.
    Corrupted { collection: String, reason: String },
}

pub struct TopologyPersistence {
    db: DB,
}

impl TopologyPersistence {
    /// Open or create the topology database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_TOPOLOGY])?;

        Ok(Self { db })
    }

    fn cf(&self) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(CF_TOPOLOGY)
            .ok_or_else(|| Error::Internal("missing topology column family".into()))
    }

    /// Write a topology revision, synced before returning
    pub fn save(&self, topology: &ClusterTopology) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db.put_cf_opt(
            self.cf()?,
            topology.collection.as_bytes(),
            encode(topology)?,
            &opts,
        )?;
        Ok(())
    }

    pub fn delete(&self, collection: &str) -> Result<()> {
        self.db.delete_cf(self.cf()?, collection.as_bytes())?;
        Ok(())
    }

    /// Read every stored record
    pub fn load_all(&self) -> Result<Vec<StoredTopology>> {
        let mut records = Vec::new();
        for item in self.db.iterator_cf(self.cf()?, IteratorMode::Start) {
            let (key, value) = item?;
            let collection = String::from_utf8_lossy(&key).into_owned();
            match decode(&value) {
                Ok(topology) if topology.collection == collection => {
                    records.push(StoredTopology::Valid(topology))
                }
                Ok(topology) => records.push(StoredTopology::Corrupted {
                    reason: format!("record names collection {}", topology.collection),
                    collection,
                }),
                Err(reason) => records.push(StoredTopology::Corrupted { collection, reason }),
            }
        }
        Ok(records)
    }

    #[cfg(test)]
    pub(crate) fn put_raw(&self, collection: &str, bytes: &[u8]) -> Result<()> {
        self.db.put_cf(self.cf()?, collection.as_bytes(), bytes)?;
        Ok(())
    }
}

fn encode(topology: &ClusterTopology) -> Result<Vec<u8>> {
    let body = bincode::serialize(topology)?;
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode(bytes: &[u8]) -> std::result::Result<ClusterTopology, String> {
    if bytes.len() < 4 {
        return Err("truncated record".into());
    }
    let (crc, body) = bytes.split_at(4);
    let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        ));
    }
    bincode::deserialize(body).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::CollectionParams;
    use tempfile::tempdir;

    fn topology(name: &str) -> ClusterTopology {
        ClusterTopology::new(
            name,
            CollectionParams {
                shard_number: 2,
                replication_factor: 2,
                write_consistency_factor: 1,
            },
            vec![vec![1, 2], vec![2, 3]],
        )
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("topology.db");

        {
            let store = TopologyPersistence::open(&path).unwrap();
            store.save(&topology("docs")).unwrap();
            store.save(&topology("images")).unwrap();
            store.delete("images").unwrap();
        }

        let store = TopologyPersistence::open(&path).unwrap();
        let records = store.load_all().unwrap();
        assert_eq!(records.len(), 1);
        match &records[0] {
            StoredTopology::Valid(t) => assert_eq!(t, &topology("docs")),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_flipped_byte_detected() {
        let dir = tempdir().unwrap();
        let store = TopologyPersistence::open(dir.path().join("topology.db")).unwrap();

        let mut bytes = encode(&topology("docs")).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        store.put_raw("docs", &bytes).unwrap();

        let records = store.load_all().unwrap();
        assert!(matches!(
            &records[0],
            StoredTopology::Corrupted { collection, reason }
                if collection == "docs" && reason.contains("checksum")
        ));
    }

    #[test]
    fn test_truncated_record() {
        assert!(decode(&[1, 2]).is_err());
    }
}
