#[cfg(test)]
mod tests {
    use crate::sstable::{GetResult, SSTable, TableBuilder, TableOptions};
    use tempfile::NamedTempFile;

    fn build(
        points: &[(&[u8], u64, Option<&[u8]>, u64)],
        ranges: &[(&[u8], &[u8], u64, u64)],
    ) -> SSTable {
        let tmp = NamedTempFile::new().unwrap();
        let mut builder = TableBuilder::new(tmp.reopen().unwrap(), TableOptions::default()).unwrap();
        for (key, lsn, value, ts) in points {
            match value {
                Some(v) => builder.add_put(key, v, *lsn, *ts).unwrap(),
                None => builder.add_delete(key, *lsn, *ts).unwrap(),
            }
        }
        for (start, end, lsn, ts) in ranges {
            builder.add_range_tombstone(start, end, *lsn, *ts).unwrap();
        }
        builder.finish().unwrap();
        SSTable::open(tmp.path()).unwrap()
    }

    #[test]
    fn get_returns_put_value() {
        let table = build(&[(b"a", 1, Some(b"1".as_slice()), 10)], &[]);
        assert_eq!(table.get(b"a").unwrap(), GetResult::Put { value: b"1".to_vec(), lsn: 1, timestamp: 10 });
    }

    #[test]
    fn get_returns_delete() {
        let table = build(&[(b"a", 1, None, 10)], &[]);
        assert_eq!(table.get(b"a").unwrap(), GetResult::Delete { lsn: 1, timestamp: 10 });
    }

    #[test]
    fn get_returns_not_found_for_absent_key() {
        let table = build(&[(b"a", 1, Some(b"1".as_slice()), 10)], &[]);
        assert_eq!(table.get(b"zzz").unwrap(), GetResult::NotFound);
    }

    #[test]
    fn get_returns_range_delete_when_key_is_covered() {
        let table = build(&[], &[(b"a", b"z", 5, 50)]);
        assert_eq!(table.get(b"m").unwrap(), GetResult::RangeDelete { lsn: 5, timestamp: 50 });
    }

    #[test]
    fn get_prefers_point_entry_with_higher_lsn_than_range_tombstone() {
        let table = build(&[(b"m", 10, Some(b"fresh".as_slice()), 100)], &[(b"a", b"z", 5, 50)]);
        assert_eq!(table.get(b"m").unwrap(), GetResult::Put { value: b"fresh".to_vec(), lsn: 10, timestamp: 100 });
    }

    #[test]
    fn get_prefers_range_tombstone_with_higher_lsn_than_point_entry() {
        let table = build(&[(b"m", 1, Some(b"stale".as_slice()), 10)], &[(b"a", b"z", 5, 50)]);
        assert_eq!(table.get(b"m").unwrap(), GetResult::RangeDelete { lsn: 5, timestamp: 50 });
    }

    #[test]
    fn get_uses_bloom_filter_to_reject_absent_point_keys() {
        let table = build(&[(b"a", 1, Some(b"1".as_slice()), 10)], &[]);
        assert!(!table.key_may_match(b"definitely-not-present-xyz"));
        assert_eq!(table.get(b"definitely-not-present-xyz").unwrap(), GetResult::NotFound);
    }

    #[test]
    fn get_finds_last_of_many_keys() {
        let tmp = NamedTempFile::new().unwrap();
        let mut builder = TableBuilder::new(tmp.reopen().unwrap(), TableOptions::default()).unwrap();
        for i in 0..1000u64 {
            let key = format!("key{i:06}");
            builder.add_put(key.as_bytes(), format!("value{i}").as_bytes(), i, i).unwrap();
        }
        builder.finish().unwrap();
        let table = SSTable::open(tmp.path()).unwrap();

        assert_eq!(
            table.get(b"key000999").unwrap(),
            GetResult::Put { value: b"value999".to_vec(), lsn: 999, timestamp: 999 }
        );
        assert_eq!(
            table.get(b"key000000").unwrap(),
            GetResult::Put { value: b"value0".to_vec(), lsn: 0, timestamp: 0 }
        );
        assert_eq!(table.get(b"key001000").unwrap(), GetResult::NotFound);
    }

    #[test]
    fn filter_disabled_via_zero_bits_per_key_still_resolves_gets() {
        let tmp = NamedTempFile::new().unwrap();
        let mut options = TableOptions::default();
        options.filter_bits_per_key = 0;
        let mut builder = TableBuilder::new(tmp.reopen().unwrap(), options).unwrap();
        builder.add_put(b"a", b"1", 1, 1).unwrap();
        builder.finish().unwrap();

        let table = SSTable::open(tmp.path()).unwrap();
        assert!(table.key_may_match(b"anything")); // no filter means everything "may match"
        assert_eq!(table.get(b"a").unwrap(), GetResult::Put { value: b"1".to_vec(), lsn: 1, timestamp: 1 });
    }
}
