//! Dictionary-compression lifecycle: training on section switch, section
//! tagging, historical decode with the encoding dictionary, and compressed
//! overflow entries.

use talusdb::dict::DICTIONARIES_TREE_NAME;
use talusdb::{Env, SliceSource, Table, TableSchema, TableValueBuilder, TableValueReader, TxView};

fn schema() -> TableSchema {
    TableSchema::new(4)
        .with_primary("key", SliceSource::Column(0))
        .compressed(true)
}

fn key_of(i: usize) -> Vec<u8> {
    format!("doc-{:06}", i).into_bytes()
}

/// JSON-shaped entries: strongly self-similar across entries, mildly
/// repetitive within one entry.
fn doc_of(i: usize) -> Vec<u8> {
    format!(
        "{{\"id\":\"doc-{:06}\",\"status\":\"active\",\"region\":\"eu-west-1\",\
         \"labels\":[\"alpha\",\"alpha\",\"alpha\",\"alpha\"],\"owner\":\"team-{}\",\
         \"description\":\"record record record record record record\",\
         \"score\":{},\"revision\":{}}}",
        i,
        i % 7,
        i % 1000,
        i % 13
    )
    .into_bytes()
}

fn dictionary_rows(tx: &impl TxView) -> usize {
    tx.state()
        .trees
        .id_by_name(DICTIONARIES_TREE_NAME)
        .and_then(|id| tx.state().trees.variable(id).ok())
        .map(|tree| tree.len())
        .unwrap_or(0)
}

#[test]
fn section_switch_trains_and_tags_a_dictionary() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::create(dir.path().join("z.tdb")).unwrap();
    let mut tx = env.write_txn();
    let table = Table::open(&mut tx, "docs", &schema()).unwrap();

    let mut builder = TableValueBuilder::new();
    let mut inserted = 0usize;
    while table.get_report(&tx, true).unwrap().sections.len() < 3 && inserted < 20_000 {
        builder.reset();
        builder.add(&key_of(inserted)).add(&doc_of(inserted));
        table.insert(&mut tx, &mut builder).unwrap();
        inserted += 1;
    }

    // The first switch retires a zero-hash section whose entries compress
    // well below the empty dictionary's sentinel ratio, so training runs
    // and the trained dictionary wins by a wide margin.
    assert!(
        dictionary_rows(&tx) >= 1,
        "section switches should have trained a dictionary"
    );
    let report = table.get_report(&tx, true).unwrap();
    assert!(
        report.sections.iter().any(|s| s.dictionary.is_some()),
        "a fresh section should be tagged with the trained dictionary: {:?}",
        report.sections
    );

    // Entries from every era decode: the zero-hash section's entries with
    // the empty dictionary, later ones with whichever dictionary their
    // section names.
    for i in (0..inserted).step_by(97) {
        let value = table.read_by_key(&tx, &key_of(i)).unwrap().unwrap();
        let reader = TableValueReader::new(&value).unwrap();
        assert_eq!(reader.column(1).unwrap(), doc_of(i).as_slice());
    }
    assert_eq!(table.number_of_entries(&tx).unwrap(), inserted as u64);
}

#[test]
fn compressed_entries_survive_commit_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("z.tdb");
    let mut inserted = 0usize;

    {
        let env = Env::create(&path).unwrap();
        let mut tx = env.write_txn();
        let table = Table::open(&mut tx, "docs", &schema()).unwrap();
        let mut builder = TableValueBuilder::new();
        while table.get_report(&tx, true).unwrap().sections.len() < 2 && inserted < 20_000 {
            builder.reset();
            builder.add(&key_of(inserted)).add(&doc_of(inserted));
            table.insert(&mut tx, &mut builder).unwrap();
            inserted += 1;
        }
        table.prepare_for_commit(&mut tx).unwrap();
        tx.commit().unwrap();
    }

    let env = Env::open(&path).unwrap();
    let tx = env.read_txn();
    let table = Table::open_read_only(&tx, "docs", &schema()).unwrap();
    assert_eq!(table.number_of_entries(&tx).unwrap(), inserted as u64);
    for i in (0..inserted).step_by(131) {
        let value = table.read_by_key(&tx, &key_of(i)).unwrap().unwrap();
        let reader = TableValueReader::new(&value).unwrap();
        assert_eq!(reader.column(1).unwrap(), doc_of(i).as_slice());
    }
}

#[test]
fn large_compressible_entries_roundtrip_through_overflow() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::create(dir.path().join("z.tdb")).unwrap();
    let mut tx = env.write_txn();
    let table = Table::open(&mut tx, "docs", &schema()).unwrap();

    // Far beyond the small-entry bound even after compression fails to
    // shrink it under the threshold; carries its dictionary hash inline.
    let big: Vec<u8> = (0..40_000u32)
        .flat_map(|i| i.wrapping_mul(2654435761).to_le_bytes())
        .collect();
    let mut builder = TableValueBuilder::new();
    builder.add(b"huge-random").add(&big);
    let id = table.insert(&mut tx, &mut builder).unwrap();
    assert_eq!(id % talusdb::config::PAGE_SIZE as u64, 0);

    let value = table.read_by_key(&tx, b"huge-random").unwrap().unwrap();
    let reader = TableValueReader::new(&value).unwrap();
    assert_eq!(reader.column(1).unwrap(), big.as_slice());

    // A highly repetitive large entry compresses and still roundtrips.
    let repetitive = b"sensor-frame:0001;".repeat(3000);
    builder.reset();
    builder.add(b"huge-repetitive").add(&repetitive);
    table.insert(&mut tx, &mut builder).unwrap();
    let value = table.read_by_key(&tx, b"huge-repetitive").unwrap().unwrap();
    let reader = TableValueReader::new(&value).unwrap();
    assert_eq!(reader.column(1).unwrap(), repetitive.as_slice());
}

/// Telemetry-shaped entries: a long shared skeleton with unique hex and
/// serial fields. One entry alone gives the codec nothing to bite on, but
/// a dictionary trained on sibling entries captures the skeleton.
fn sensor_doc(i: usize) -> Vec<u8> {
    let a = (i as u32).wrapping_mul(2_654_435_761);
    let b = (i as u32).wrapping_mul(40_503).wrapping_add(0x9E37_79B9);
    format!(
        "unit=m-{}|site=atrium-north|class=env-sensor|fw=2.18.{}|cal={:08x}|chk={:08x}|bat={}|sig=-{}|mode=field-ops",
        100_000 + i,
        i % 9,
        a,
        b,
        10 + i % 89,
        30 + i % 60
    )
    .into_bytes()
}

/// The same skeleton with a long flat tail: compresses hard on its own,
/// which drags a section's observed ratio far under the training gate.
fn padded_sensor_doc(i: usize) -> Vec<u8> {
    let mut doc = sensor_doc(50_000 + i);
    doc.extend(std::iter::repeat(b'#').take(160));
    doc
}

#[test]
fn compaction_driven_section_switch_retrains_a_dictionary() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::create(dir.path().join("z.tdb")).unwrap();
    let mut tx = env.write_txn();
    let table = Table::open(&mut tx, "sensors", &schema()).unwrap();

    // Fill the first section with skeleton-only entries. They stay raw (or
    // compress only marginally), so the insert-driven switch that retires
    // the section sees no observed ratio worth acting on and keeps the
    // empty dictionary.
    let mut builder = TableValueBuilder::new();
    let mut first_batch = 0usize;
    while table.get_report(&tx, true).unwrap().sections.len() < 2 && first_batch < 20_000 {
        builder.reset();
        builder.add(&key_of(first_batch)).add(&sensor_doc(first_batch));
        table.insert(&mut tx, &mut builder).unwrap();
        first_batch += 1;
    }
    assert_eq!(
        dictionary_rows(&tx),
        0,
        "raw-only section must not train on the insert-driven switch"
    );

    // Pack the new active section nearly full with self-compressing
    // entries: their ratios sink far below the gate, and the leftover
    // space is too small for the first section's survivors.
    let mut second_batch = 0usize;
    loop {
        let density = {
            let report = table.get_report(&tx, true).unwrap();
            report
                .sections
                .iter()
                .max_by_key(|s| s.data_pages)
                .map(|s| s.density)
                .unwrap()
        };
        if density >= 0.95 || second_batch >= 20_000 {
            break;
        }
        builder.reset();
        builder
            .add(&format!("pad-{:06}", second_batch).into_bytes())
            .add(&padded_sensor_doc(second_batch));
        table.insert(&mut tx, &mut builder).unwrap();
        second_batch += 1;
    }
    assert_eq!(
        dictionary_rows(&tx),
        0,
        "packing the active section must not switch sections"
    );

    // Thin the first section far below the compaction threshold. Its
    // survivors exhaust the packed active section mid-relocation, forcing
    // a compaction-driven switch. That switch must train and adopt a
    // dictionary: the retiring section's best ratio is far under the gate
    // and the survivors share the trained skeleton.
    for i in 0..first_batch {
        if i % 8 != 0 {
            assert!(table.delete_by_key(&mut tx, &key_of(i)).unwrap());
        }
    }

    assert!(
        dictionary_rows(&tx) >= 1,
        "compaction-driven switch should have trained a dictionary"
    );
    let report = table.get_report(&tx, true).unwrap();
    assert!(
        report.sections.iter().any(|s| s.dictionary.is_some()),
        "the fresh section must be tagged with the trained dictionary: {:?}",
        report.sections
    );

    // Every entry decodes, wherever relocation and re-encoding put it.
    for i in (0..first_batch).filter(|i| i % 8 == 0) {
        let value = table.read_by_key(&tx, &key_of(i)).unwrap().unwrap();
        let reader = TableValueReader::new(&value).unwrap();
        assert_eq!(reader.column(1).unwrap(), sensor_doc(i).as_slice());
    }
    for i in 0..second_batch {
        let key = format!("pad-{:06}", i).into_bytes();
        let value = table.read_by_key(&tx, &key).unwrap().unwrap();
        let reader = TableValueReader::new(&value).unwrap();
        assert_eq!(reader.column(1).unwrap(), padded_sensor_doc(i).as_slice());
    }
    let survivors = (0..first_batch).filter(|i| i % 8 == 0).count();
    assert_eq!(
        table.number_of_entries(&tx).unwrap(),
        (survivors + second_batch) as u64
    );
}

#[test]
fn deletes_and_compaction_re_encode_across_dictionaries() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::create(dir.path().join("z.tdb")).unwrap();
    let mut tx = env.write_txn();
    let table = Table::open(&mut tx, "docs", &schema()).unwrap();

    let mut builder = TableValueBuilder::new();
    let mut inserted = 0usize;
    while table.get_report(&tx, true).unwrap().sections.len() < 3 && inserted < 20_000 {
        builder.reset();
        builder.add(&key_of(inserted)).add(&doc_of(inserted));
        table.insert(&mut tx, &mut builder).unwrap();
        inserted += 1;
    }

    // Collapse the earliest sections; their survivors re-encode against
    // the active section's dictionary as they relocate.
    for i in 0..inserted {
        if i % 13 != 0 {
            table.delete_by_key(&mut tx, &key_of(i)).unwrap();
        }
    }

    let survivors = (0..inserted).filter(|i| i % 13 == 0).count();
    assert_eq!(table.number_of_entries(&tx).unwrap(), survivors as u64);
    for i in (0..inserted).filter(|i| i % 13 == 0) {
        let value = table.read_by_key(&tx, &key_of(i)).unwrap().unwrap();
        let reader = TableValueReader::new(&value).unwrap();
        assert_eq!(reader.column(1).unwrap(), doc_of(i).as_slice());
    }
}
