mod common;

use std::sync::Arc;

use common::{create_temp_db_file, cursor, drain, event, manual_clock, repository, sequences, types};
use ledgerdb::{EventData, ExpectedVersion, ReadSpec, Stream};

#[test]
fn paging_the_cursor_yields_every_event_once_in_order() {
    let (_dir, path) = create_temp_db_file("pages.db");
    let repo = repository(&path, Arc::new(manual_clock()));

    let mut expected = Vec::new();
    for i in 0..120u64 {
        // Mix single events and batches across a few streams.
        let batch: Vec<EventData> = (0..(i % 3 + 1)).map(|_| event("E")).collect();
        let result = repo
            .append(batch, &Stream::new(format!("s{}", i % 4)), ExpectedVersion::Auto)
            .unwrap();
        expected.extend(result.first_sequence.as_raw()..=result.last_sequence.as_raw());
    }

    for page_size in [1, 7, 64, 1000] {
        assert_eq!(drain(&cursor(&path), page_size), expected, "page size {page_size}");
    }
}

#[test]
fn abandoned_numbers_do_not_stall_paging() {
    let (_dir, path) = create_temp_db_file("abandoned.db");
    let repo = repository(&path, Arc::new(manual_clock()));

    let mut expected = Vec::new();
    for i in 0..30 {
        if i % 4 == 1 {
            repo.begin_append(3).unwrap().rollback();
            continue;
        }
        let result = repo
            .append(vec![event("E")], &Stream::Global, ExpectedVersion::Any)
            .unwrap();
        expected.push(result.first_sequence.as_raw());
    }

    assert_eq!(drain(&cursor(&path), 5), expected);
}

#[test]
fn stream_reads_page_with_exclusive_bounds() {
    let (_dir, path) = create_temp_db_file("stream_pages.db");
    let repo = repository(&path, Arc::new(manual_clock()));
    let stream = Stream::new("ledger");
    let names = ["a", "b", "c", "d", "e"];
    let ids = repo
        .append(names.iter().map(|n| event(n)).collect(), &stream, ExpectedVersion::Auto)
        .unwrap()
        .event_ids;

    let page = repo
        .read(&ReadSpec::stream(stream.clone()).from(ids[0]).limit(2))
        .unwrap();
    assert_eq!(types(&page), ["b", "c"]);

    let page = repo
        .read(&ReadSpec::stream(stream.clone()).from(ids[0]).to(ids[4]))
        .unwrap();
    assert_eq!(types(&page), ["b", "c", "d"]);

    let page = repo
        .read(&ReadSpec::stream(stream.clone()).backward().from(ids[3]))
        .unwrap();
    assert_eq!(types(&page), ["c", "b", "a"]);

    assert_eq!(
        repo.count(&ReadSpec::stream(stream).from(ids[1])).unwrap(),
        3
    );
}

#[test]
fn global_reads_filter_by_type() {
    let (_dir, path) = create_temp_db_file("types.db");
    let repo = repository(&path, Arc::new(manual_clock()));
    for t in ["Created", "Updated", "Deleted", "Updated"] {
        repo.append(vec![event(t)], &Stream::Global, ExpectedVersion::Any)
            .unwrap();
    }

    let updates = repo.read(&ReadSpec::global().of_type("Updated")).unwrap();
    assert_eq!(sequences(&updates), [2, 4]);
    assert!(updates.iter().all(|e| e.position.is_none()));

    let newest = repo.read(&ReadSpec::global().backward().limit(1)).unwrap();
    assert_eq!(types(&newest), ["Updated"]);
    assert_eq!(sequences(&newest), [4]);
}
