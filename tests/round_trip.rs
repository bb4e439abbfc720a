//! End-to-end scenarios: write a container, read it back sequentially and
//! through indexed queries, and check the on-disk guarantees.

use std::collections::HashSet;
use std::io::Cursor;

use rust_sav::value::MISSING_INT8;
use rust_sav::{
    BoundingPolicy, IndexMode, IndexedReader, Reader, Record, Region, TypedValue, Writer,
    WriterOptions,
};

fn base_headers() -> Vec<(String, String)> {
    vec![
        ("fileformat".to_string(), "VCFv4.2".to_string()),
        ("phasing".to_string(), "partial".to_string()),
        (
            "contig".to_string(),
            "<ID=chr1,length=248956422>".to_string(),
        ),
        ("contig".to_string(), "<ID=chr2,length=242193529>".to_string()),
        (
            "INFO".to_string(),
            "<ID=END,Number=1,Type=Integer,Description=\"End position\">".to_string(),
        ),
        (
            "FORMAT".to_string(),
            "<ID=GT,Number=.,Type=Integer,Description=\"Genotype\">".to_string(),
        ),
        (
            "FORMAT".to_string(),
            "<ID=DS,Number=1,Type=Float,Description=\"Dosage\">".to_string(),
        ),
    ]
}

fn write_to_vec(
    records: &[Record],
    samples: Vec<String>,
    opts: WriterOptions,
) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut writer = Writer::new(&mut buf, base_headers(), samples, opts).unwrap();
    for record in records {
        writer.write(record).unwrap();
    }
    writer.close().unwrap();
    drop(writer);
    buf
}

fn diploid_record(contig: &str, pos: u32, gt: &[i64]) -> Record {
    let mut record = Record::new(contig, pos, "A", vec!["T".to_string()]);
    record.set_format("GT", TypedValue::from_ints(gt));
    record.set_format("PH", TypedValue::from_ints(&vec![1; gt.len() / 2]));
    record
}

#[test]
fn empty_file_round_trips_without_trailer() {
    let buf = write_to_vec(&[], Vec::new(), WriterOptions::default());
    let mut reader = Reader::new(&buf[..]).unwrap();
    assert_eq!(reader.samples().len(), 0);
    assert!(reader.next().is_none());
    // no records, no index trailer
    assert!(!buf
        .windows(4)
        .any(|w| w == 0x184D_2A50u32.to_le_bytes()));

    let mut indexed = IndexedReader::new(Cursor::new(buf)).unwrap();
    assert!(!indexed.has_index());
    let hits: Vec<_> = indexed
        .query(&Region::new("chr1", 1, 1000), BoundingPolicy::Any)
        .unwrap()
        .collect();
    assert!(hits.is_empty());
}

#[test]
fn single_record_with_mixed_phasing() {
    // GT = 0|1, 1|. under phasing=partial
    let mut record = Record::new("chr1", 100, "A", vec!["T".to_string()]);
    record.set_format(
        "GT",
        TypedValue::from_ints(&[0, 1, 1, i64::from(MISSING_INT8)]),
    );
    record.set_format("PH", TypedValue::from_ints(&[1, 0]));
    let buf = write_to_vec(
        std::slice::from_ref(&record),
        vec!["s1".to_string(), "s2".to_string()],
        WriterOptions::default(),
    );

    let reader = Reader::new(&buf[..]).unwrap();
    let records: Vec<Record> = reader.map(Result::unwrap).collect();
    assert_eq!(records.len(), 1);
    let gt = records[0].get_format("GT").unwrap();
    assert_eq!(gt.len(), 4);
    assert_eq!(
        gt.dense_ints().unwrap(),
        vec![0, 1, 1, i64::from(MISSING_INT8)]
    );
    let ph = records[0].get_format("PH").unwrap();
    assert_eq!(ph.len(), 2);
    assert_eq!(ph.dense_ints().unwrap(), vec![1, 0]);
}

#[test]
fn gt_without_ph_is_rejected_under_partial_phasing() {
    let mut record = Record::new("chr1", 100, "A", vec!["T".to_string()]);
    record.set_format("GT", TypedValue::from_ints(&[0, 1]));
    let mut buf = Vec::new();
    let mut writer = Writer::new(
        &mut buf,
        base_headers(),
        vec!["s1".to_string()],
        WriterOptions::default(),
    )
    .unwrap();
    assert!(writer.write(&record).is_err());
    // the writer is poisoned from here on
    assert!(writer.write(&record).is_err());
}

#[test]
fn many_records_index_and_point_query() {
    let samples = vec!["s1".to_string(), "s2".to_string()];
    let records: Vec<Record> = (0..5000u32)
        .map(|i| diploid_record("chr1", 1000 + i * 10, &[0, 1, 1, 0]))
        .collect();
    let opts = WriterOptions {
        block_size: 1000,
        ..WriterOptions::default()
    };
    let buf = write_to_vec(&records, samples, opts);

    // sequential read sees everything in order
    let reader = Reader::new(&buf[..]).unwrap();
    let read: Vec<Record> = reader.map(Result::unwrap).collect();
    assert_eq!(read.len(), 5000);
    assert!(read.windows(2).all(|w| w[0].pos() < w[1].pos()));

    // point query returns exactly the matching record
    let mut indexed = IndexedReader::new(Cursor::new(buf)).unwrap();
    assert!(indexed.has_index());
    let target = read[2500].pos();
    let hits: Vec<Record> = indexed
        .query(
            &Region::new("chr1", u64::from(target), u64::from(target)),
            BoundingPolicy::Beg,
        )
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].pos(), target);
}

#[test]
fn pbwt_round_trip_across_blocks_and_contigs() {
    let samples = vec!["s1".to_string(), "s2".to_string(), "s3".to_string()];
    let columns: Vec<Vec<i64>> = (0..50)
        .map(|i| {
            (0..6)
                .map(|j| i64::from((i * 7 + j * 3) % 2))
                .collect::<Vec<i64>>()
        })
        .collect();
    let mut records = Vec::new();
    for (i, column) in columns.iter().enumerate() {
        // second half switches contig, forcing a block flush + reset
        let contig = if i < 25 { "chr1" } else { "chr2" };
        let pos = 100 + (i % 25) as u32;
        records.push(diploid_record(contig, pos, column));
    }
    let opts = WriterOptions {
        block_size: 10,
        ..WriterOptions::default()
    }
    .pbwt(vec!["GT"]);
    let buf = write_to_vec(&records, samples, opts);

    let reader = Reader::new(&buf[..]).unwrap();
    let read: Vec<Record> = reader.map(Result::unwrap).collect();
    assert_eq!(read.len(), records.len());
    for (record, column) in read.iter().zip(&columns) {
        assert_eq!(
            record.get_format("GT").unwrap().dense_ints().unwrap(),
            *column
        );
    }
}

#[test]
fn end_info_extends_block_bounds() {
    // SV record spanning [100, 200] via INFO END
    let mut sv = Record::new("chr1", 100, "A", vec!["<DEL>".to_string()]);
    sv.set_info("END", TypedValue::int_scalar(200));
    sv.set_format("GT", TypedValue::from_ints(&[0, 1]));
    sv.set_format("PH", TypedValue::from_ints(&[1]));
    let buf = write_to_vec(
        std::slice::from_ref(&sv),
        vec!["s1".to_string()],
        WriterOptions::default(),
    );

    let mut indexed = IndexedReader::new(Cursor::new(buf)).unwrap();
    let region = Region::new("chr1", 150, 150);
    let any: Vec<Record> = indexed
        .query(&region, BoundingPolicy::Any)
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(any.len(), 1);
    let beg: Vec<Record> = indexed
        .query(&region, BoundingPolicy::Beg)
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert!(beg.is_empty());
}

#[test]
fn interleaved_contigs_flush_blocks_and_keep_file_order() {
    let samples = vec!["s1".to_string()];
    let records = vec![
        diploid_record("chr1", 100, &[0, 1]),
        diploid_record("chr2", 100, &[1, 1]),
        diploid_record("chr1", 5000, &[0, 0]),
    ];
    let buf = write_to_vec(&records, samples, WriterOptions::default());

    let reader = Reader::new(&buf[..]).unwrap();
    let read: Vec<Record> = reader.map(Result::unwrap).collect();
    let order: Vec<(String, u32)> = read
        .iter()
        .map(|r| (r.chrom().clone(), r.pos()))
        .collect();
    assert_eq!(
        order,
        vec![
            ("chr1".to_string(), 100),
            ("chr2".to_string(), 100),
            ("chr1".to_string(), 5000),
        ]
    );

    // both chr1 blocks are reachable through the index
    let mut indexed = IndexedReader::new(Cursor::new(buf)).unwrap();
    let chr1: Vec<Record> = indexed
        .query(&Region::new("chr1", 1, u64::MAX), BoundingPolicy::Any)
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(chr1.len(), 2);
}

#[test]
fn sample_subsetting_matches_projection() {
    let samples = vec!["s1".to_string(), "s2".to_string(), "s3".to_string()];
    let mut record = Record::new("chr1", 100, "A", vec!["T".to_string()]);
    record.set_format("GT", TypedValue::from_ints(&[0, 1, 1, 1, 0, 0]));
    record.set_format("PH", TypedValue::from_ints(&[1, 1, 1]));
    record.set_format("DS", TypedValue::from_floats(&[0.5, 2.0, 0.0]));
    let buf = write_to_vec(
        std::slice::from_ref(&record),
        samples,
        WriterOptions::default(),
    );

    let mut reader = Reader::new(&buf[..]).unwrap();
    let wanted: HashSet<String> = ["s1", "s3"].iter().map(|s| s.to_string()).collect();
    let kept = reader.subset_samples(&wanted);
    assert_eq!(kept, vec!["s1".to_string(), "s3".to_string()]);
    let read: Vec<Record> = reader.map(Result::unwrap).collect();
    assert_eq!(
        read[0].get_format("GT").unwrap().dense_ints().unwrap(),
        vec![0, 1, 0, 0]
    );
    assert_eq!(
        read[0].get_format("DS").unwrap().copy_as_dense().dense_floats().unwrap(),
        vec![0.5, 0.0]
    );
}

#[test]
fn level_zero_bypasses_zstd() {
    let samples = vec!["s1".to_string()];
    let records: Vec<Record> = (0..10u32)
        .map(|i| diploid_record("chr1", 100 + i, &[0, 1]))
        .collect();
    let opts = WriterOptions {
        compression_level: 0,
        ..WriterOptions::default()
    };
    let buf = write_to_vec(&records, samples, opts);

    // no zstd frame magic anywhere in the container
    assert!(!buf
        .windows(4)
        .any(|w| w == 0xFD2F_B528u32.to_le_bytes()));

    let reader = Reader::new(&buf[..]).unwrap();
    assert!(!reader.is_compressed());
    let read: Vec<Record> = reader.map(Result::unwrap).collect();
    assert_eq!(read.len(), 10);

    // the embedded index still serves queries over the raw layout
    let mut indexed = IndexedReader::new(Cursor::new(buf)).unwrap();
    assert!(indexed.has_index());
    let hits: Vec<Record> = indexed
        .query(&Region::new("chr1", 105, 105), BoundingPolicy::Beg)
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].pos(), 105);
}

#[test]
fn sparse_format_stays_small_and_reconstructs() {
    let n = 100_000usize;
    let mut dense = vec![0i64; n];
    for i in 0..100 {
        dense[i * 997] = 1;
    }
    let mut record = Record::new("chr1", 100, "A", vec!["T".to_string()]);
    let value = TypedValue::from_ints(&dense);
    let sparse = value.copy_as_sparse().unwrap();
    assert_eq!(sparse.non_zero_len(), 100);
    record.set_format("EC", sparse.clone());

    let mut serialized = Vec::new();
    sparse.serialize(&mut serialized, 1);
    // two control bytes, the typed nnz, then 100 offset/value pairs
    assert!(serialized.len() <= 2 + 100 * (2 + 1) + 8);
    assert_eq!(sparse.copy_as_dense().dense_ints().unwrap(), dense);
}

#[test]
fn separate_index_file_mode() {
    let dir = tempfile::tempdir().unwrap();
    let index_path = dir.path().join("out.s1r");
    let samples = vec!["s1".to_string()];
    let records: Vec<Record> = (0..10u32)
        .map(|i| diploid_record("chr1", 100 + i, &[0, 1]))
        .collect();
    let opts = WriterOptions {
        index: IndexMode::File(index_path.clone()),
        ..WriterOptions::default()
    };
    let buf = write_to_vec(&records, samples, opts);

    // nothing appended to the container, index lives in its own file
    assert!(!buf.windows(4).any(|w| w == 0x184D_2A50u32.to_le_bytes()));
    let payload = std::fs::read(&index_path).unwrap();
    let index = rust_sav::s1r::IndexReader::new(payload).unwrap();
    assert_eq!(index.contigs().collect::<Vec<_>>(), vec!["chr1"]);
}

#[test]
fn uuid_and_header_survive() {
    let buf = write_to_vec(&[], vec!["s1".to_string()], WriterOptions::default());
    let reader = Reader::new(&buf[..]).unwrap();
    assert_ne!(reader.uuid(), &[0u8; 16]);
    assert_eq!(*reader.header().phasing(), rust_sav::Phasing::Partial);
    assert!(reader.header().info_header("END").is_some());
    // PH was injected next to GT
    assert!(reader.header().format_header("PH").is_some());
}

#[test]
fn truncated_container_poisons_reader() {
    let samples = vec!["s1".to_string()];
    let records: Vec<Record> = (0..100u32)
        .map(|i| diploid_record("chr1", 100 + i, &[0, 1]))
        .collect();
    let opts = WriterOptions {
        compression_level: 0,
        index: rust_sav::IndexMode::Disabled,
        ..WriterOptions::default()
    };
    let buf = write_to_vec(&records, samples, opts);
    let cut = buf.len() - 5;
    let mut reader = Reader::new(&buf[..cut]).unwrap();
    let mut saw_error = false;
    for record in &mut reader {
        if record.is_err() {
            saw_error = true;
        }
    }
    assert!(saw_error);
    assert!(reader.next().is_none());
}
