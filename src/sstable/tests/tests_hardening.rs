//! SSTable structural boundary tests.
//!
//! These tests cover builder/reader edge cases that the basic/get/scan
//! suites don't: tombstone-only tables, range-tombstone-only tables, and
//! a table whose index has exactly one block handle.
//!
//! ## See also
//! - [`super::tests_edge_cases`]  — duplicate keys, empty values, adjacent ranges
//! - [`super::tests_corruption`]  — block-level checksum corruption detection
//! - [`super::tests_basic`]       — standard build/open/property validation
//! - [`super::tests_get`]         — LSN resolution in `get()`

#[cfg(test)]
mod tests {
    use crate::engine::Record;
    use crate::sstable::{GetResult, PointEntry, RangeTombstone, SSTable, SstWriter};
    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder().with_max_level(Level::TRACE).try_init();
    }

    fn point(key: &[u8], value: Option<&[u8]>, lsn: u64, timestamp: u64) -> PointEntry {
        PointEntry { key: key.to_vec(), value: value.map(|v| v.to_vec()), lsn, timestamp }
    }

    fn rdel(start: &[u8], end: &[u8], lsn: u64, timestamp: u64) -> RangeTombstone {
        RangeTombstone { start: start.to_vec(), end: end.to_vec(), lsn, timestamp }
    }

    #[test]
    fn tombstone_only_table_has_no_values_but_resolves_deletes() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("table.sst");

        let entries = vec![point(b"a", None, 1, 1), point(b"b", None, 2, 2)];
        SstWriter::new(&path).build(entries.into_iter(), 2, Vec::new().into_iter(), 0).unwrap();

        let table = SSTable::open(&path).unwrap();
        assert_eq!(table.properties.record_count, 2);
        assert_eq!(table.properties.tombstone_count, 2);
        assert_eq!(table.get(b"a").unwrap(), GetResult::Delete { lsn: 1, timestamp: 1 });
    }

    #[test]
    fn range_tombstone_only_table_has_no_point_entries() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("table.sst");

        let ranges = vec![rdel(b"a", b"m", 1, 1)];
        SstWriter::new(&path).build(Vec::<PointEntry>::new().into_iter(), 0, ranges.into_iter(), 1).unwrap();

        let table = SSTable::open(&path).unwrap();
        assert_eq!(table.properties.record_count, 0);
        assert!(table.has_range_tombstones());
        assert_eq!(table.get(b"f").unwrap(), GetResult::RangeDelete { lsn: 1, timestamp: 1 });
        assert_eq!(table.get(b"z").unwrap(), GetResult::NotFound);

        let records: Vec<Record> = table.scan(b"", b"\xff").unwrap().collect();
        assert_eq!(records.len(), 1);
        assert!(matches!(&records[0], Record::RangeDelete { .. }));
    }

    #[test]
    fn single_block_index_still_seeks_correctly_at_boundaries() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("table.sst");

        // Small enough to fit in one data block with default settings.
        let entries = vec![point(b"a", Some(b"1"), 1, 1), point(b"m", Some(b"2"), 2, 2), point(b"z", Some(b"3"), 3, 3)];
        SstWriter::new(&path).build(entries.into_iter(), 3, Vec::new().into_iter(), 0).unwrap();

        let table = SSTable::open(&path).unwrap();
        assert_eq!(table.get(b"a").unwrap(), GetResult::Put { value: b"1".to_vec(), lsn: 1, timestamp: 1 });
        assert_eq!(table.get(b"z").unwrap(), GetResult::Put { value: b"3".to_vec(), lsn: 3, timestamp: 3 });
        assert_eq!(table.get(b"zzz").unwrap(), GetResult::NotFound);
        assert_eq!(table.get(b""), table.get(b""));
    }

    #[test]
    fn no_filter_no_tombstones_table_degrades_gracefully() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("table.sst");
        let entries = vec![point(b"solo", Some(b"value"), 1, 1)];
        SstWriter::new(&path).build(entries.into_iter(), 1, Vec::new().into_iter(), 0).unwrap();

        let table = SSTable::open(&path).unwrap();
        assert!(!table.has_range_tombstones());
        assert!(table.get_range_tombstones().is_empty());
    }
}
