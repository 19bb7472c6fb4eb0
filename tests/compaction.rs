//! Section lifecycle under heavy deletion: density-driven candidate
//! tracking, compaction-by-relocation, and the active-section exemption.

use talusdb::config::{INITIAL_SECTION_DATA_PAGES, MAX_SECTION_DATA_PAGES};
use talusdb::{Env, SliceSource, Table, TableSchema, TableValueBuilder, TableValueReader};

fn schema() -> TableSchema {
    TableSchema::new(3).with_primary("key", SliceSource::Column(0))
}

fn key_of(i: usize) -> Vec<u8> {
    format!("entry-{:05}", i).into_bytes()
}

fn payload_of(i: usize) -> Vec<u8> {
    let mut payload = format!("payload-{:05}-", i).into_bytes();
    payload.resize(500, (i % 251) as u8);
    payload
}

#[test]
fn mass_deletion_compacts_sections_and_keeps_survivors_reachable() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::create(dir.path().join("c.tdb")).unwrap();
    let mut tx = env.write_txn();
    let table = Table::open(&mut tx, "bulk", &schema()).unwrap();

    let mut builder = TableValueBuilder::new();
    for i in 0..1000 {
        builder.reset();
        builder.add(&key_of(i)).add(&payload_of(i));
        table.insert(&mut tx, &mut builder).unwrap();
    }

    let before = table.get_report(&tx, true).unwrap();
    assert!(
        before.sections.len() >= 3,
        "1000 half-KB entries should span several sections, got {}",
        before.sections.len()
    );

    // Delete 900 of 1000 interleaved; every section's density collapses
    // below the compaction threshold.
    for i in 0..1000 {
        if i % 10 != 0 {
            assert!(table.delete_by_key(&mut tx, &key_of(i)).unwrap());
        }
    }

    assert_eq!(table.number_of_entries(&tx).unwrap(), 100);
    let after = table.get_report(&tx, true).unwrap();
    assert!(
        after.sections.len() < before.sections.len(),
        "compaction should have freed sections: {} -> {}",
        before.sections.len(),
        after.sections.len()
    );

    // Every survivor is still reachable through the primary index and
    // decodes to its original payload, wherever relocation put it.
    for i in (0..1000).step_by(10) {
        let value = table
            .read_by_key(&tx, &key_of(i))
            .unwrap()
            .unwrap_or_else(|| panic!("survivor {} lost", i));
        let reader = TableValueReader::new(&value).unwrap();
        assert_eq!(reader.column(1).unwrap(), payload_of(i).as_slice());
    }
    for index in &after.indexes {
        assert_eq!(index.entries, 100, "index {} diverged", index.name);
    }
}

#[test]
fn deleting_everything_returns_the_table_to_its_pre_insert_counts() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::create(dir.path().join("c.tdb")).unwrap();
    let mut tx = env.write_txn();
    let table = Table::open(&mut tx, "bulk", &schema()).unwrap();

    let mut builder = TableValueBuilder::new();
    for i in 0..50 {
        builder.reset();
        builder.add(&key_of(i)).add(&payload_of(i));
        table.insert(&mut tx, &mut builder).unwrap();
    }
    for i in 0..50 {
        assert!(table.delete_by_key(&mut tx, &key_of(i)).unwrap());
    }

    let report = table.get_report(&tx, true).unwrap();
    assert_eq!(report.number_of_entries, 0);
    assert_eq!(report.overflow_page_count, 0);
    for index in &report.indexes {
        assert_eq!(index.entries, 0, "index {} diverged", index.name);
    }
}

#[test]
fn deletes_in_the_active_section_never_compact_it() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::create(dir.path().join("c.tdb")).unwrap();
    let mut tx = env.write_txn();
    let table = Table::open(&mut tx, "bulk", &schema()).unwrap();

    // A handful of entries all live in the one (active) section; deleting
    // all but one drives density to near zero, yet the section must stay.
    let mut builder = TableValueBuilder::new();
    for i in 0..10 {
        builder.reset();
        builder.add(&key_of(i)).add(&payload_of(i));
        table.insert(&mut tx, &mut builder).unwrap();
    }
    let section_count = table.get_report(&tx, true).unwrap().sections.len();
    assert_eq!(section_count, 1);

    for i in 1..10 {
        assert!(table.delete_by_key(&mut tx, &key_of(i)).unwrap());
    }

    let report = table.get_report(&tx, true).unwrap();
    assert_eq!(report.sections.len(), 1, "active section must survive");
    assert_eq!(report.number_of_entries, 1);
    assert!(table.read_by_key(&tx, &key_of(0)).unwrap().is_some());
}

#[test]
fn moderate_density_promotes_to_candidate_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::create(dir.path().join("c.tdb")).unwrap();
    let mut tx = env.write_txn();
    let table = Table::open(&mut tx, "bulk", &schema()).unwrap();

    // Fill well past one section so the first section retires.
    let mut builder = TableValueBuilder::new();
    let mut count = 0usize;
    while table.get_report(&tx, true).unwrap().sections.len() < 2 {
        builder.reset();
        builder.add(&key_of(count)).add(&payload_of(count));
        table.insert(&mut tx, &mut builder).unwrap();
        count += 1;
    }

    // Thin the first (now retired) section into the candidate band:
    // delete entries until its density sits in (0.15, 0.5].
    let mut deleted = 0usize;
    for i in 0..count {
        if i % 5 != 0 {
            table.delete_by_key(&mut tx, &key_of(i)).unwrap();
            deleted += 1;
            if deleted * 10 >= count * 7 {
                break;
            }
        }
    }

    let report = table.get_report(&tx, true).unwrap();
    let candidates: Vec<_> = report
        .sections
        .iter()
        .filter(|s| s.density > 0.0 && s.density <= 0.5)
        .collect();
    assert!(
        !candidates.is_empty(),
        "thinned section should be tracked: {:?}",
        report.sections
    );

    // Inserts keep succeeding and land somewhere sane afterwards.
    builder.reset();
    builder.add(b"after").add(&payload_of(1));
    table.insert(&mut tx, &mut builder).unwrap();
    assert!(table.read_by_key(&tx, b"after").unwrap().is_some());
}

#[test]
fn section_growth_doubles_and_respects_the_cap() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::create(dir.path().join("c.tdb")).unwrap();
    let mut tx = env.write_txn();
    let table = Table::open(&mut tx, "bulk", &schema()).unwrap();

    let mut builder = TableValueBuilder::new();
    let mut i = 0usize;
    while table.get_report(&tx, true).unwrap().sections.len() < 3 {
        builder.reset();
        builder.add(&key_of(i)).add(&payload_of(i));
        table.insert(&mut tx, &mut builder).unwrap();
        i += 1;
    }

    let report = table.get_report(&tx, true).unwrap();
    let mut sizes: Vec<usize> = report.sections.iter().map(|s| s.data_pages).collect();
    sizes.sort_unstable();
    assert_eq!(sizes[0], INITIAL_SECTION_DATA_PAGES);
    assert_eq!(sizes[1], INITIAL_SECTION_DATA_PAGES * 2);
    for size in sizes {
        assert!(size <= MAX_SECTION_DATA_PAGES);
    }
}
