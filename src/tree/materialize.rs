//! # Page Materialization
//!
//! Turns a faulted `PageRef` into an in-memory page image, re-attaching
//! any updates that were spilled to the lookaside table when the page was
//! last evicted.
//!
//! ## Fault protocol
//!
//! Many actors may fault the same ref at once; the state-machine CAS picks
//! one winner, and losers return immediately with no work (someone else is
//! producing the page they want). The winner performs all I/O and
//! allocation outside any lock, then publishes with a release store.
//!
//! ## Lookaside instantiation
//!
//! Spilled records for a block arrive in key-then-update order: a run of
//! in-order updates for one user key, then a run for the next key. The
//! scan accumulates one key's updates, and on key change flushes them into
//! the page as a chain whose head is the first update scanned. Records
//! whose transaction has become globally visible are skipped; the on-page
//! value already covers them.
//!
//! After instantiation the page's in-memory counter grows by the bytes
//! allocated and the dirty bit is cleared: the chains are reconstructible
//! from the still-present lookaside records, so the page can stay cheap to
//! evict. A writer that later dirties the page re-spills as needed.

use smallvec::SmallVec;
use tracing::debug;

use crate::encoding::decode_recno;
use crate::error::{Result, StoreError};
use crate::mvcc::lookaside::LookasideStore;
use crate::mvcc::update::UpdateRecord;
use crate::mvcc::Visibility;
use crate::storage::{BlockAddr, BlockReader, PageImage};

use super::page_ref::{PageRef, RefState};

/// Collaborators a fault needs: the tree identity, block access, the spill
/// table, and the visibility oracle.
pub struct FaultContext<'a> {
    pub tree_id: u32,
    pub blocks: &'a dyn BlockReader,
    pub lookaside: &'a LookasideStore,
    pub visibility: &'a dyn Visibility,
}

/// Makes `page_ref` resident: on return with `Ok`, either this call built
/// and published the image, or another actor owns the fault and will.
/// On error the ref is back in the state it had on entry and owns no page
/// memory.
pub fn read_page(ctx: &FaultContext<'_>, page_ref: &PageRef) -> Result<()> {
    let Some(previous) = page_ref.try_begin_fault() else {
        // Lost the race (or the page is already resident): nothing to do.
        return Ok(());
    };

    match build_image(ctx, page_ref, previous) {
        Ok(image) => {
            debug!(
                tree_id = ctx.tree_id,
                page_type = ?image.page_type(),
                entries = image.entry_count(),
                "page read"
            );
            page_ref.publish(image);
            Ok(())
        }
        Err(err) => {
            page_ref.rollback(previous);
            Err(err)
        }
    }
}

fn build_image(
    ctx: &FaultContext<'_>,
    page_ref: &PageRef,
    previous: RefState,
) -> Result<Box<PageImage>> {
    // No address: the page was deleted and its block discarded, and a
    // search or insert is re-creating the name space.
    let Some(addr) = page_ref.addr() else {
        if previous != RefState::Deleted {
            return Err(StoreError::invariant(
                "ref without address is not in the deleted state",
            ));
        }
        return Ok(Box::new(PageImage::empty_leaf()));
    };

    let disk = ctx.blocks.read(addr)?;
    let mut image = Box::new(PageImage::from_disk(disk)?);

    // The page was logically deleted: rebuild the tombstone view before
    // layering any spilled updates on top.
    if previous == RefState::Deleted {
        image.instantiate_deleted(page_ref.delete_txn().unwrap_or(0));
    }

    // The spilled flag may have been set long ago; only scan if the
    // lookaside table is currently active.
    if image.has_spilled_updates() && ctx.lookaside.is_active() {
        instantiate_lookaside(ctx, &mut image, addr)?;
    }

    Ok(image)
}

#[derive(PartialEq, Eq)]
enum CurrentKey {
    Recno(u64),
    Row(Vec<u8>),
}

fn instantiate_lookaside(
    ctx: &FaultContext<'_>,
    image: &mut PageImage,
    addr: &BlockAddr,
) -> Result<()> {
    let cookie = addr.pack();
    let is_column = image.page_type().is_column();

    let mut cursor = ctx.lookaside.cursor();
    match cursor.seek_block_prefix(ctx.tree_id, &cookie) {
        Ok(()) => {}
        // An empty scan is legal; the flag only means "possibly spilled".
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => return Err(err),
    }

    let mut current: Option<CurrentKey> = None;
    let mut pending: SmallVec<[Box<UpdateRecord>; 8]> = SmallVec::new();
    let mut total_incr = 0usize;
    let mut instantiated = 0usize;

    loop {
        let key = match cursor.get_key() {
            Ok(key) => key,
            Err(err) if err.is_not_found() => break,
            Err(err) => return Err(err),
        };
        // The prefix check ends the scan: first key with a different tree,
        // address size, or address bytes.
        if !key.matches_block(ctx.tree_id, &cookie) {
            break;
        }

        // Skip records whose on-page value is now globally visible; the
        // check is a pure read on monotonic state, independent of any
        // concurrent removal of the record.
        if !ctx.visibility.is_globally_visible(key.txn_id) {
            let user_key = key.user_key.clone();
            let value = cursor.get_value()?;
            let (update, incr) = match value.data() {
                Some(bytes) => UpdateRecord::value(value.txn_id, bytes),
                None => UpdateRecord::tombstone(value.txn_id),
            };
            total_incr += incr;

            let this_key = if is_column {
                let (recno, _) = decode_recno(&user_key)?;
                CurrentKey::Recno(recno)
            } else {
                CurrentKey::Row(user_key)
            };

            // Key change: flush the accumulated chain into the page, then
            // start a new one. `update` and `pending` are distinct owners
            // until the push below; an error in between drops both.
            if current.as_ref() != Some(&this_key) {
                if let Some(done) = current.take() {
                    flush_chain(image, done, &mut pending);
                    instantiated += 1;
                }
                current = Some(this_key);
            }
            pending.push(update);
        }

        match cursor.next() {
            Ok(()) => {}
            Err(err) if err.is_not_found() => break,
            Err(err) => return Err(err),
        }
    }

    // Trailing chain.
    if let Some(done) = current.take() {
        flush_chain(image, done, &mut pending);
        instantiated += 1;
    }

    if total_incr != 0 {
        image.incr_memory(total_incr);
        // The chain is reconstructible from the still-present lookaside
        // records; leaving the page clean keeps it cheap to evict.
        image.clear_dirty();
    }

    debug!(
        tree_id = ctx.tree_id,
        keys = instantiated,
        bytes = total_incr,
        "lookaside instantiation"
    );
    Ok(())
}

fn flush_chain(
    image: &mut PageImage,
    key: CurrentKey,
    pending: &mut SmallVec<[Box<UpdateRecord>; 8]>,
) {
    let Some(chain) = UpdateRecord::chain(pending.drain(..)) else {
        return;
    };
    match key {
        CurrentKey::Recno(recno) => image.attach_recno_updates(recno, chain),
        CurrentKey::Row(user_key) => image.attach_row_updates(&user_key, chain),
    }
}
