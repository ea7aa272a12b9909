//! Page fault and lookaside instantiation, end to end: disk images built
//! through the real block reader, spilled updates re-attached through the
//! real cursor, and the ref state machine observed from the outside.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;

use keeldb_core::encoding::encode_recno;
use keeldb_core::error::StoreError;
use keeldb_core::mvcc::lookaside::{LookasideStore, LookasideValue};
use keeldb_core::mvcc::update::UpdateRecord;
use keeldb_core::mvcc::VisibilityWatermark;
use keeldb_core::storage::{
    append_block, BlockAddr, BlockReader, DiskBytes, DiskPageHeader, FileBlockReader, PageType,
    PAGE_FLAG_SPILLED, PAGE_MAGIC,
};
use keeldb_core::tree::{read_page, FaultContext, PageRef, RefState};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn row_leaf_bytes(flags: u8, cells: &[(&[u8], &[u8])]) -> Vec<u8> {
    let header = DiskPageHeader {
        magic: PAGE_MAGIC,
        page_type: PageType::RowLeaf as u8,
        flags,
        entry_count: cells.len() as u16,
        start_recno: 0,
    };
    let mut page = header.to_bytes().to_vec();
    for (key, value) in cells {
        encode_recno(key.len() as u64, &mut page);
        page.extend_from_slice(key);
        encode_recno(value.len() as u64, &mut page);
        page.extend_from_slice(value);
    }
    page
}

fn col_var_bytes(flags: u8, cells: &[(u64, &[u8])]) -> Vec<u8> {
    let header = DiskPageHeader {
        magic: PAGE_MAGIC,
        page_type: PageType::ColVar as u8,
        flags,
        entry_count: cells.len() as u16,
        start_recno: cells.first().map_or(0, |(r, _)| *r),
    };
    let mut page = header.to_bytes().to_vec();
    for (recno, value) in cells {
        encode_recno(*recno, &mut page);
        encode_recno(value.len() as u64, &mut page);
        page.extend_from_slice(value);
    }
    page
}

struct Fixture {
    _dir: TempDir,
    reader: FileBlockReader,
    addr: BlockAddr,
}

fn write_page(bytes: &[u8]) -> Fixture {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tree");
    let addr = append_block(&path, bytes).unwrap();
    let reader = FileBlockReader::open_mapped(&path).unwrap();
    Fixture {
        _dir: dir,
        reader,
        addr,
    }
}

fn recno_key(recno: u64) -> Vec<u8> {
    let mut key = Vec::new();
    encode_recno(recno, &mut key);
    key
}

/// Scenario: a row page flagged as spilled, lookaside holding K1 with
/// three updates (transactions 10, 12, 14; 10 already globally visible)
/// and K2 with one (transaction 13). K1 gets a two-record chain in scan
/// order, K2 a one-record chain, the page stays clean, and the in-memory
/// counter grows by exactly the allocated bytes.
#[test]
fn lookaside_instantiation_reattaches_chains() {
    init_tracing();
    let fx = write_page(&row_leaf_bytes(
        PAGE_FLAG_SPILLED,
        &[(b"k1", b"old1"), (b"k2", b"old2")],
    ));
    let cookie = fx.addr.pack();

    let lookaside = LookasideStore::new();
    lookaside.spill(1, &cookie, b"k1", 10, &LookasideValue::value(10, b"v10"));
    lookaside.spill(1, &cookie, b"k1", 12, &LookasideValue::value(12, b"v12"));
    lookaside.spill(1, &cookie, b"k1", 14, &LookasideValue::value(14, b"v14"));
    lookaside.spill(1, &cookie, b"k2", 13, &LookasideValue::tombstone(13));

    // Transaction 10 is globally visible; its record must be filtered.
    let visibility = VisibilityWatermark::new(10);
    let ctx = FaultContext {
        tree_id: 1,
        blocks: &fx.reader,
        lookaside: &lookaside,
        visibility: &visibility,
    };
    let page_ref = PageRef::new_disk(fx.addr.clone());

    read_page(&ctx, &page_ref).unwrap();

    assert_eq!(page_ref.state(), RefState::Mem);
    let page = page_ref.page().unwrap();

    // K1: chain of two, head txn 12 then txn 14, matching scan order.
    let k1 = page.updates(0).unwrap();
    assert_eq!(k1.txn_id, 12);
    assert_eq!(k1.data(), Some(b"v12".as_ref()));
    let next = k1.next().unwrap();
    assert_eq!(next.txn_id, 14);
    assert_eq!(next.data(), Some(b"v14".as_ref()));
    assert!(next.next().is_none());

    // K2: one tombstone record.
    let k2 = page.updates(1).unwrap();
    assert_eq!(k2.txn_id, 13);
    assert!(k2.is_tombstone());
    assert!(k2.next().is_none());

    // No chain carries the globally visible transaction.
    for i in 0..page.entry_count() {
        let mut cursor = page.updates(i);
        while let Some(update) = cursor {
            assert_ne!(update.txn_id, 10);
            cursor = update.next();
        }
    }

    // Counter grew by exactly the allocated bytes; dirty bit cleared.
    let expected = UpdateRecord::value(12, b"v12").1
        + UpdateRecord::value(14, b"v14").1
        + UpdateRecord::tombstone(13).1;
    assert_eq!(page.memory_footprint(), expected);
    assert!(!page.is_dirty());

    // The spilled records stay put; the chains are reconstructible.
    assert_eq!(lookaside.len(), 4);
}

/// Column pages decode the user key as a record number.
#[test]
fn column_page_keys_decode_as_record_numbers() {
    init_tracing();
    let fx = write_page(&col_var_bytes(
        PAGE_FLAG_SPILLED,
        &[(7, b"seven"), (9, b"nine")],
    ));
    let cookie = fx.addr.pack();

    let lookaside = LookasideStore::new();
    lookaside.spill(3, &cookie, &recno_key(9), 20, &LookasideValue::value(20, b"w1"));
    lookaside.spill(3, &cookie, &recno_key(9), 21, &LookasideValue::value(21, b"w2"));
    // A record number with no on-page cell creates an entry.
    lookaside.spill(3, &cookie, &recno_key(8), 22, &LookasideValue::value(22, b"w3"));

    let visibility = VisibilityWatermark::new(0);
    let ctx = FaultContext {
        tree_id: 3,
        blocks: &fx.reader,
        lookaside: &lookaside,
        visibility: &visibility,
    };
    let page_ref = PageRef::new_disk(fx.addr.clone());

    read_page(&ctx, &page_ref).unwrap();
    let page = page_ref.page().unwrap();

    assert_eq!(page.entry_count(), 3);
    assert_eq!(page.recno(0), Some(7));
    assert_eq!(page.recno(1), Some(8));
    assert_eq!(page.recno(2), Some(9));

    let inserted = page.updates(1).unwrap();
    assert_eq!(inserted.txn_id, 22);

    let chain = page.updates(2).unwrap();
    assert_eq!(chain.txn_id, 20);
    assert_eq!(chain.next().unwrap().txn_id, 21);
}

/// The scan touches only the target block prefix: neighbors with a
/// different tree id or address are untouched and contribute nothing.
#[test]
fn scan_is_bounded_by_block_prefix() {
    init_tracing();
    let fx = write_page(&row_leaf_bytes(PAGE_FLAG_SPILLED, &[(b"k", b"v")]));
    let cookie = fx.addr.pack();

    let mut other_cookie = cookie.clone();
    other_cookie.push(0xAB);

    let lookaside = LookasideStore::new();
    lookaside.spill(1, &cookie, b"k", 5, &LookasideValue::value(5, b"mine"));
    lookaside.spill(1, &other_cookie, b"k", 6, &LookasideValue::value(6, b"other-addr"));
    lookaside.spill(2, &cookie, b"k", 7, &LookasideValue::value(7, b"other-tree"));

    let visibility = VisibilityWatermark::new(0);
    let ctx = FaultContext {
        tree_id: 1,
        blocks: &fx.reader,
        lookaside: &lookaside,
        visibility: &visibility,
    };
    let page_ref = PageRef::new_disk(fx.addr.clone());

    read_page(&ctx, &page_ref).unwrap();
    let page = page_ref.page().unwrap();

    let chain = page.updates(0).unwrap();
    assert_eq!(chain.txn_id, 5);
    assert!(chain.next().is_none());
    assert_eq!(lookaside.len(), 3);
}

struct CountingReader<'a> {
    inner: &'a FileBlockReader,
    reads: AtomicUsize,
}

impl BlockReader for CountingReader<'_> {
    fn read(&self, addr: &BlockAddr) -> Result<DiskBytes, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(addr)
    }
}

/// Scenario: two actors fault the same ref concurrently. Exactly one
/// performs I/O; the other returns immediately; the final state is `Mem`
/// with one valid page.
#[test]
fn concurrent_fault_has_a_single_winner() {
    init_tracing();
    let fx = write_page(&row_leaf_bytes(0, &[(b"k", b"v")]));
    let reader = CountingReader {
        inner: &fx.reader,
        reads: AtomicUsize::new(0),
    };
    let lookaside = LookasideStore::new();
    let visibility = VisibilityWatermark::new(0);
    let ctx = FaultContext {
        tree_id: 1,
        blocks: &reader,
        lookaside: &lookaside,
        visibility: &visibility,
    };
    let page_ref = PageRef::new_disk(fx.addr.clone());
    let barrier = Barrier::new(2);

    std::thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| {
                barrier.wait();
                read_page(&ctx, &page_ref).unwrap();
            });
        }
    });

    assert_eq!(reader.reads.load(Ordering::SeqCst), 1);
    assert_eq!(page_ref.state(), RefState::Mem);
    let page = page_ref.page().unwrap();
    assert_eq!(page.entry_count(), 1);
    assert_eq!(page.row_key(0).unwrap(), b"k");
}

/// Any failure between the fault claim and publication restores the entry
/// state and leaves the ref owning no page memory. Here the failure is a
/// corrupt record-number key discovered mid-instantiation.
#[test]
fn instantiation_failure_rolls_back_the_ref() {
    init_tracing();
    let fx = write_page(&col_var_bytes(PAGE_FLAG_SPILLED, &[(7, b"seven")]));
    let cookie = fx.addr.pack();

    let lookaside = LookasideStore::new();
    // Truncated record-number encoding: decodes with an error.
    lookaside.spill(1, &cookie, &[0xF9, 0x01], 5, &LookasideValue::value(5, b"v"));

    let visibility = VisibilityWatermark::new(0);
    let ctx = FaultContext {
        tree_id: 1,
        blocks: &fx.reader,
        lookaside: &lookaside,
        visibility: &visibility,
    };
    let page_ref = PageRef::new_disk(fx.addr.clone());

    let err = read_page(&ctx, &page_ref).unwrap_err();
    assert!(matches!(err, StoreError::Format(_)));
    assert_eq!(page_ref.state(), RefState::Disk);
    assert!(page_ref.page().is_none());

    // The ref is still faultable once the corruption is repaired.
    lookaside.remove_block(1, &cookie).unwrap();
    read_page(&ctx, &page_ref).unwrap();
    assert_eq!(page_ref.state(), RefState::Mem);
}

/// A deleted ref whose block still exists rebuilds the tombstone view and
/// then layers spilled updates on top of it.
#[test]
fn deleted_ref_reinstates_tombstones_before_lookaside() {
    init_tracing();
    let fx = write_page(&row_leaf_bytes(PAGE_FLAG_SPILLED, &[(b"k", b"v")]));
    let cookie = fx.addr.pack();

    let lookaside = LookasideStore::new();
    lookaside.spill(1, &cookie, b"k", 30, &LookasideValue::value(30, b"newer"));

    let visibility = VisibilityWatermark::new(0);
    let ctx = FaultContext {
        tree_id: 1,
        blocks: &fx.reader,
        lookaside: &lookaside,
        visibility: &visibility,
    };
    let page_ref = PageRef::new_deleted(Some(fx.addr.clone()), Some(25));

    read_page(&ctx, &page_ref).unwrap();

    let page = page_ref.page().unwrap();
    let chain = page.updates(0).unwrap();
    // Spilled update chains head the slot; the delete tombstone follows.
    assert_eq!(chain.txn_id, 30);
    let tombstone = chain.next().unwrap();
    assert_eq!(tombstone.txn_id, 25);
    assert!(tombstone.is_tombstone());
}
