use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use waps_packet::WapsFragment;

use crate::{fingerprint, FragmentStore, Result, StoreError, StoredFragment};

/// Append-only JSON lines store
pub struct JsonlStore {
    path: PathBuf,
    writer: BufWriter<File>,
    seen: HashSet<u64>,
    records: usize,
    next_sequence: u64,
}

impl JsonlStore {
    /// Open or create the store, rebuilding the de-duplication index
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let (existing, valid_len) = if path.exists() {
            read_records(&path)?
        } else {
            (Vec::new(), 0)
        };
        let seen = existing
            .iter()
            .map(|r| fingerprint(r.generation, &r.fragment))
            .collect();
        let next_sequence = existing.last().map_or(1, |r| r.sequence + 1);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if file.metadata()?.len() > valid_len {
            file.set_len(valid_len)?;
        }
        info!(
            "Replay store {} opened with {} records",
            path.display(),
            existing.len()
        );

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            seen,
            records: existing.len(),
            next_sequence,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every complete record. Also returns the byte length covered by
/// them, so a torn trailing line can be cut off before appending.
fn read_records(path: &Path) -> Result<(Vec<StoredFragment>, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    let mut valid_len = 0u64;
    let mut line = String::new();
    let mut number = 0;

    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        number += 1;
        // an interrupted append leaves a torn last line
        if !line.ends_with('\n') {
            warn!("Ignoring incomplete last record in {}", path.display());
            break;
        }
        if !line.trim().is_empty() {
            let record = serde_json::from_str::<StoredFragment>(line.trim_end()).map_err(|e| {
                StoreError::Corrupt {
                    line: number,
                    reason: e.to_string(),
                }
            })?;
            records.push(record);
        }
        valid_len += read as u64;
    }
    Ok((records, valid_len))
}

impl FragmentStore for JsonlStore {
    fn append(&mut self, generation: u32, fragment: &WapsFragment) -> Result<bool> {
        let print = fingerprint(generation, fragment);
        if self.seen.contains(&print) {
            return Ok(false);
        }

        let record = StoredFragment {
            sequence: self.next_sequence,
            generation,
            fragment: fragment.clone(),
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;

        self.seen.insert(print);
        self.next_sequence += 1;
        self.records += 1;
        Ok(true)
    }

    fn load(&mut self) -> Result<Vec<StoredFragment>> {
        self.writer.flush()?;
        Ok(read_records(&self.path)?.0)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn len(&self) -> usize {
        self.records
    }
}

impl Drop for JsonlStore {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("Replay store flush on close failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fragment;
    use std::io::Write as _;
    use waps_packet::ChannelKey;

    #[test]
    fn test_reopen_keeps_order_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store").join("fragments.jsonl");

        {
            let mut store = JsonlStore::open(&path).unwrap();
            assert!(store.append(1, &fragment(4, 2, b"two")).unwrap());
            assert!(store.append(1, &fragment(4, 0, b"zero")).unwrap());
            assert!(!store.append(1, &fragment(4, 2, b"two")).unwrap());
            store.flush().unwrap();
        }

        let mut store = JsonlStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert!(!store.append(1, &fragment(4, 0, b"zero")).unwrap());
        assert!(store.append(2, &fragment(4, 0, b"zero")).unwrap());
        store.flush().unwrap();

        let records = store.load().unwrap();
        let order: Vec<(u64, u32, u16)> = records
            .iter()
            .map(|r| (r.sequence, r.generation, r.fragment.index))
            .collect();
        assert_eq!(order, vec![(1, 1, 2), (2, 1, 0), (3, 2, 0)]);
        assert_eq!(records[0].fragment.payload, b"two");

        let key = ChannelKey::from_ids(1, 4).unwrap();
        assert_eq!(store.lookup(key, 2).unwrap().len(), 1);
    }

    #[test]
    fn test_torn_last_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fragments.jsonl");
        {
            let mut store = JsonlStore::open(&path).unwrap();
            store.append(1, &fragment(1, 0, b"a")).unwrap();
            store.flush().unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"sequence\":2,\"gen").unwrap();
        drop(file);

        let mut store = JsonlStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.append(1, &fragment(1, 1, b"b")).unwrap());

        let records = store.load().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].sequence, 2);
    }

    #[test]
    fn test_corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fragments.jsonl");
        fs::write(&path, "not json\n{}\n").unwrap();
        assert!(matches!(
            JsonlStore::open(&path),
            Err(StoreError::Corrupt { line: 1, .. })
        ));
    }
}
