#[cfg(test)]
mod tests {
    use crate::engine::{PointEntry, RangeTombstone};
    use crate::sstable::{SSTable, SstWriter, TableBuilder, TableOptions};
    use tempfile::{NamedTempFile, TempDir};
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder().with_max_level(Level::TRACE).try_init();
    }

    fn point(key: &[u8], value: &[u8], lsn: u64, timestamp: u64) -> PointEntry {
        PointEntry { key: key.to_vec(), value: Some(value.to_vec()), lsn, timestamp }
    }

    fn del(key: &[u8], lsn: u64, timestamp: u64) -> PointEntry {
        PointEntry { key: key.to_vec(), value: None, lsn, timestamp }
    }

    fn rdel(start: &[u8], end: &[u8], lsn: u64, timestamp: u64) -> RangeTombstone {
        RangeTombstone { start: start.to_vec(), end: end.to_vec(), lsn, timestamp }
    }

    #[test]
    fn test_sstable_build_and_open() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let sstable_path = tmp.path().join("sstable_1.sst");

        let point_entries = vec![
            point(b"apple", b"red", 1, 100),
            point(b"banana", b"yellow", 2, 101),
            point(b"cherry", b"dark-red", 3, 102),
            del(b"strawberry", 4, 103),
        ];
        let range_tombstones = vec![rdel(b"grape", b"kiwi", 5, 110), rdel(b"orange", b"plum", 6, 120)];

        SstWriter::new(&sstable_path)
            .build(point_entries.into_iter(), 4, range_tombstones.into_iter(), 2)
            .unwrap();

        let table = SSTable::open(&sstable_path).unwrap();
        assert_eq!(table.properties.record_count, 4);
        assert_eq!(table.properties.tombstone_count, 1);
        assert_eq!(table.properties.range_tombstones_count, 2);
        assert_eq!(table.properties.min_key, b"apple");
        assert_eq!(table.properties.max_key, b"strawberry");
        assert!(table.has_range_tombstones());
    }

    #[test]
    fn empty_table_round_trips() {
        let tmp = NamedTempFile::new().unwrap();
        let builder = TableBuilder::new(tmp.reopen().unwrap(), TableOptions::default()).unwrap();
        builder.finish().unwrap();

        let table = SSTable::open(tmp.path()).unwrap();
        assert_eq!(table.properties.record_count, 0);
        assert!(!table.has_range_tombstones());
        assert_eq!(table.get(b"anything").unwrap(), crate::sstable::GetResult::NotFound);
    }

    #[test]
    fn builder_defaults_use_format_version_six_and_crc32c() {
        let opts = TableOptions::default();
        assert_eq!(opts.format_version, 6);
        assert_eq!(opts.checksum_type, crate::checksum::ChecksumType::Crc32c);
    }

    #[test]
    fn multi_block_table_spans_several_data_blocks() {
        let tmp = NamedTempFile::new().unwrap();
        let mut options = TableOptions::default();
        options.block_size = 64; // force many small data blocks
        let mut builder = TableBuilder::new(tmp.reopen().unwrap(), options).unwrap();
        for i in 0..500u64 {
            let key = format!("key{i:06}");
            builder.add_put(key.as_bytes(), b"some reasonably sized value", i, i).unwrap();
        }
        builder.finish().unwrap();

        let table = SSTable::open(tmp.path()).unwrap();
        assert_eq!(table.properties.record_count, 500);
        let mut it = table.new_iterator();
        it.seek_to_first();
        let mut count = 0;
        while it.valid() {
            count += 1;
            it.next();
        }
        assert_eq!(count, 500);
    }
}
