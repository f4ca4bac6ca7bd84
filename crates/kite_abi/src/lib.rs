//! C ABI façade.
//!
//! Opaque struct pointers and plain functions only, so bindings never
//! recompile against internal representations. Errors cross the boundary
//! as NUL-terminated strings prefixed with their kind (`CONFLICT: ...`);
//! null means success, and the caller releases the string through
//! `kite_error_free`. Collections, transactions and arenas reference the
//! database, so the database must outlive them.
//!
//! Argument conventions mirror the core batch surface: array arguments
//! carry an element stride in bytes, stride 0 broadcasts the first
//! element, a null collections pointer addresses the default collection,
//! and a null values pointer in a write deletes the keys.

#![allow(clippy::missing_safety_doc)]

use std::ffi::{c_char, CStr, CString};

use kite_core::{
    Arena, CollectionId, Database, Key, Options, ReadTasks, ScanTasks, Strided, Transaction,
    WriteTasks,
};

/// Opaque database handle.
pub struct KiteDb {
    db: Database,
}

/// Opaque transaction handle. References its database; single-owner.
pub struct KiteTxn {
    db: *const KiteDb,
    txn: Transaction,
}

/// Opaque request arena.
pub struct KiteArena {
    arena: Arena,
}

// ── Error channel ────────────────────────────────────────────────────────

unsafe fn export_error(error: kite_core::KiteError, err_out: *mut *mut c_char) {
    if err_out.is_null() {
        return;
    }
    let message = error.to_abi_string();
    // Interior NULs cannot survive a C string; replace rather than drop
    // the diagnostic.
    let cstring = CString::new(message)
        .unwrap_or_else(|_| CString::new("INTERNAL: diagnostic contained NUL").expect("static"));
    *err_out = cstring.into_raw();
}

unsafe fn clear_error(err_out: *mut *mut c_char) {
    if !err_out.is_null() {
        *err_out = std::ptr::null_mut();
    }
}

fn invalid(message: &str) -> kite_core::KiteError {
    kite_core::KiteError::InvalidArgument(message.into())
}

/// Release an error string returned by any `kite_` function.
///
/// # Safety
/// `err` must be null or a pointer previously produced by this library.
#[no_mangle]
pub unsafe extern "C" fn kite_error_free(err: *mut c_char) {
    if !err.is_null() {
        drop(CString::from_raw(err));
    }
}

// ── Argument decoding ────────────────────────────────────────────────────

unsafe fn decode_options(bits: u32, err_out: *mut *mut c_char) -> Option<Options> {
    match Options::from_bits(bits) {
        Some(options) => Some(options),
        None => {
            export_error(invalid("unknown option bits"), err_out);
            None
        }
    }
}

/// Strided view over an optional array argument. A null base is the
/// absent (`0`) form; stride 0 broadcasts the first element.
unsafe fn strided<'a, T: Copy>(base: *const T, stride: usize, count: usize) -> Strided<'a, T> {
    if base.is_null() || count == 0 {
        Strided::empty()
    } else {
        Strided::from_raw_parts(base, stride, count)
    }
}

unsafe fn arena_mut<'a>(
    arena_inout: *mut *mut KiteArena,
    err_out: *mut *mut c_char,
) -> Option<&'a mut KiteArena> {
    if arena_inout.is_null() {
        export_error(invalid("arena out-pointer is null"), err_out);
        return None;
    }
    if (*arena_inout).is_null() {
        *arena_inout = Box::into_raw(Box::new(KiteArena {
            arena: Arena::new(),
        }));
    }
    Some(&mut **arena_inout)
}

unsafe fn txn_opt<'a>(txn: *mut KiteTxn) -> Option<&'a mut Transaction> {
    if txn.is_null() {
        None
    } else {
        Some(&mut (*txn).txn)
    }
}

// ── Database lifecycle ───────────────────────────────────────────────────

/// Open or create a database. `config` is a location string (null or
/// empty for the in-memory engine).
///
/// # Safety
/// `config` must be null or a NUL-terminated string; `db_out` must be a
/// valid out-pointer.
#[no_mangle]
pub unsafe extern "C" fn kite_open(
    config: *const c_char,
    db_out: *mut *mut KiteDb,
    err_out: *mut *mut c_char,
) {
    clear_error(err_out);
    if db_out.is_null() {
        export_error(invalid("database out-pointer is null"), err_out);
        return;
    }
    let location = if config.is_null() {
        ""
    } else {
        match CStr::from_ptr(config).to_str() {
            Ok(location) => location,
            Err(_) => {
                export_error(invalid("config string is not UTF-8"), err_out);
                return;
            }
        }
    };
    match Database::open(location) {
        Ok(db) => *db_out = Box::into_raw(Box::new(KiteDb { db })),
        Err(error) => export_error(error, err_out),
    }
}

/// Close the database and release its state. Outstanding transaction,
/// collection and arena handles become invalid.
///
/// # Safety
/// `db` must be null or a handle from `kite_open`, not used afterwards.
#[no_mangle]
pub unsafe extern "C" fn kite_free(db: *mut KiteDb) {
    if !db.is_null() {
        drop(Box::from_raw(db));
    }
}

/// Pull database metadata, mostly for logging and support.
///
/// # Safety
/// `db` must be a live handle; out-pointers may be null to skip a field.
#[no_mangle]
pub unsafe extern "C" fn kite_database_status(
    db: *const KiteDb,
    collections_out: *mut usize,
    active_transactions_out: *mut usize,
    current_seq_out: *mut u64,
    err_out: *mut *mut c_char,
) {
    clear_error(err_out);
    if db.is_null() {
        export_error(invalid("database handle is null"), err_out);
        return;
    }
    let status = (*db).db.status();
    if !collections_out.is_null() {
        *collections_out = status.collections;
    }
    if !active_transactions_out.is_null() {
        *active_transactions_out = status.active_transactions as usize;
    }
    if !current_seq_out.is_null() {
        *current_seq_out = status.current_seq.0;
    }
}

// ── Collections ──────────────────────────────────────────────────────────

/// Get-or-create a collection; null or empty name addresses the default
/// collection. The returned handle is a plain id, valid until the
/// database closes.
///
/// # Safety
/// `db` must be live; `name` null or NUL-terminated; `col_out` valid.
#[no_mangle]
pub unsafe extern "C" fn kite_collection_open(
    db: *const KiteDb,
    name: *const c_char,
    col_out: *mut u64,
    err_out: *mut *mut c_char,
) {
    clear_error(err_out);
    if db.is_null() || col_out.is_null() {
        export_error(invalid("null handle or out-pointer"), err_out);
        return;
    }
    let name = if name.is_null() {
        None
    } else {
        match CStr::from_ptr(name).to_str() {
            Ok(name) => Some(name),
            Err(_) => {
                export_error(invalid("collection name is not UTF-8"), err_out);
                return;
            }
        }
    };
    match (*db).db.collection_open(name) {
        Ok(col) => *col_out = col.0,
        Err(error) => export_error(error, err_out),
    }
}

/// Remove a collection: the default collection is emptied but kept.
///
/// # Safety
/// `db` must be live; `name` null or NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn kite_collection_remove(
    db: *const KiteDb,
    name: *const c_char,
    err_out: *mut *mut c_char,
) {
    clear_error(err_out);
    if db.is_null() {
        export_error(invalid("database handle is null"), err_out);
        return;
    }
    let name = if name.is_null() {
        None
    } else {
        match CStr::from_ptr(name).to_str() {
            Ok(name) => Some(name),
            Err(_) => {
                export_error(invalid("collection name is not UTF-8"), err_out);
                return;
            }
        }
    };
    if let Err(error) = (*db).db.collection_remove(name) {
        export_error(error, err_out);
    }
}

/// Collection handles are plain ids; freeing is a no-op kept for ABI
/// symmetry.
///
/// # Safety
/// Always safe.
#[no_mangle]
pub unsafe extern "C" fn kite_collection_free(_db: *const KiteDb, _col: u64) {}

// ── Transactions ─────────────────────────────────────────────────────────

/// Begin a transaction. When `*txn_inout` already holds a handle it is
/// reset: the previous transaction aborts, its sets clear, and a fresh
/// snapshot is taken. `seq_hint` is reserved.
///
/// # Safety
/// `db` must be live; `txn_inout` must be a valid in-out pointer holding
/// null or a handle from a previous call with the same database.
#[no_mangle]
pub unsafe extern "C" fn kite_txn_begin(
    db: *const KiteDb,
    _seq_hint: u64,
    options: u32,
    txn_inout: *mut *mut KiteTxn,
    err_out: *mut *mut c_char,
) {
    clear_error(err_out);
    if db.is_null() || txn_inout.is_null() {
        export_error(invalid("null handle or out-pointer"), err_out);
        return;
    }
    if decode_options(options, err_out).is_none() {
        return;
    }
    if (*txn_inout).is_null() {
        match (*db).db.begin() {
            Ok(txn) => *txn_inout = Box::into_raw(Box::new(KiteTxn { db, txn })),
            Err(error) => export_error(error, err_out),
        }
    } else {
        let handle = &mut **txn_inout;
        if !std::ptr::eq(handle.db, db) {
            export_error(invalid("transaction belongs to another database"), err_out);
            return;
        }
        if let Err(error) = (*db).db.txn_reset(&mut handle.txn) {
            export_error(error, err_out);
        }
    }
}

/// Commit. On success the assigned sequence number is stored through
/// `seq_out` (when non-null). On conflict the transaction state is
/// preserved so the caller may retry via `kite_txn_begin`.
///
/// # Safety
/// `txn` must be a live handle whose database is still open.
#[no_mangle]
pub unsafe extern "C" fn kite_txn_commit(
    txn: *mut KiteTxn,
    options: u32,
    seq_out: *mut u64,
    err_out: *mut *mut c_char,
) {
    clear_error(err_out);
    if txn.is_null() {
        export_error(invalid("transaction handle is null"), err_out);
        return;
    }
    let Some(options) = decode_options(options, err_out) else {
        return;
    };
    let handle = &mut *txn;
    match (*handle.db).db.commit(&mut handle.txn, options) {
        Ok(seq) => {
            if !seq_out.is_null() {
                *seq_out = seq.0;
            }
        }
        Err(error) => export_error(error, err_out),
    }
}

/// Abort (if still open) and release a transaction handle.
///
/// # Safety
/// `txn` must be null or a live handle, not used afterwards.
#[no_mangle]
pub unsafe extern "C" fn kite_txn_free(db: *const KiteDb, txn: *mut KiteTxn) {
    if txn.is_null() {
        return;
    }
    let mut handle = Box::from_raw(txn);
    if !db.is_null() {
        (*db).db.abort(&mut handle.txn);
    }
}

// ── Batch read / write / scan ────────────────────────────────────────────

/// Batch point read. On success `*lens_out` points at `count` lengths
/// (`u32::MAX` marks absence) and `*vals_out` at the concatenated value
/// bytes, both owned by the arena.
///
/// # Safety
/// Pointer arguments must satisfy the stride convention for `count`
/// elements; the arena must not be shared across concurrent requests.
#[no_mangle]
pub unsafe extern "C" fn kite_read(
    db: *const KiteDb,
    txn: *mut KiteTxn,
    count: usize,
    cols: *const u64,
    cols_stride: usize,
    keys: *const u64,
    keys_stride: usize,
    options: u32,
    lens_out: *mut *const u32,
    vals_out: *mut *const u8,
    arena_inout: *mut *mut KiteArena,
    err_out: *mut *mut c_char,
) {
    clear_error(err_out);
    if db.is_null() || keys.is_null() || lens_out.is_null() || vals_out.is_null() {
        export_error(invalid("null handle or pointer argument"), err_out);
        return;
    }
    let Some(options) = decode_options(options, err_out) else {
        return;
    };
    let Some(arena) = arena_mut(arena_inout, err_out) else {
        return;
    };
    let tasks = ReadTasks::new(
        strided(cols.cast::<CollectionId>(), cols_stride, cols_count(cols, count)),
        strided(keys.cast::<Key>(), keys_stride, count),
    );
    match (*db).db.read(txn_opt(txn), &tasks, options, &mut arena.arena) {
        Ok(tape) => {
            *lens_out = tape.lens().as_ptr();
            *vals_out = tape.bytes().as_ptr();
        }
        Err(error) => export_error(error, err_out),
    }
}

/// Batch presence check: like `kite_read` but yields one byte per task
/// (0 = absent) and copies no value bytes.
///
/// # Safety
/// As for `kite_read`.
#[no_mangle]
pub unsafe extern "C" fn kite_contains(
    db: *const KiteDb,
    txn: *mut KiteTxn,
    count: usize,
    cols: *const u64,
    cols_stride: usize,
    keys: *const u64,
    keys_stride: usize,
    options: u32,
    flags_out: *mut *const u8,
    arena_inout: *mut *mut KiteArena,
    err_out: *mut *mut c_char,
) {
    clear_error(err_out);
    if db.is_null() || keys.is_null() || flags_out.is_null() {
        export_error(invalid("null handle or pointer argument"), err_out);
        return;
    }
    let Some(options) = decode_options(options, err_out) else {
        return;
    };
    let Some(arena) = arena_mut(arena_inout, err_out) else {
        return;
    };
    let tasks = ReadTasks::new(
        strided(cols.cast::<CollectionId>(), cols_stride, cols_count(cols, count)),
        strided(keys.cast::<Key>(), keys_stride, count),
    );
    match (*db)
        .db
        .contains(txn_opt(txn), &tasks, options, &mut arena.arena)
    {
        Ok(tape) => *flags_out = tape.flags().as_ptr(),
        Err(error) => export_error(error, err_out),
    }
}

/// Batch upsert/delete. A null `vals` pointer deletes every task's key;
/// per-task null value pointers delete selectively. Inside a transaction
/// the writes are buffered until commit.
///
/// # Safety
/// Pointer arguments must satisfy the stride convention; every non-null
/// value pointer must stay readable for `offs[i] + lens[i]` bytes for
/// the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn kite_write(
    db: *const KiteDb,
    txn: *mut KiteTxn,
    count: usize,
    cols: *const u64,
    cols_stride: usize,
    keys: *const u64,
    keys_stride: usize,
    vals: *const *const u8,
    vals_stride: usize,
    offs: *const u32,
    offs_stride: usize,
    lens: *const u32,
    lens_stride: usize,
    options: u32,
    err_out: *mut *mut c_char,
) {
    clear_error(err_out);
    if db.is_null() || keys.is_null() {
        export_error(invalid("null handle or pointer argument"), err_out);
        return;
    }
    let Some(options) = decode_options(options, err_out) else {
        return;
    };
    let tasks = WriteTasks {
        cols: strided(cols.cast::<CollectionId>(), cols_stride, cols_count(cols, count)),
        keys: strided(keys.cast::<Key>(), keys_stride, count),
        vals: strided(vals, vals_stride, if vals.is_null() { 0 } else { count }),
        offs: strided(offs, offs_stride, if offs.is_null() { 0 } else { count }),
        lens: strided(lens, lens_stride, if lens.is_null() { 0 } else { count }),
    };
    if let Err(error) = (*db).db.write(txn_opt(txn), &tasks, options) {
        export_error(error, err_out);
    }
}

/// Batch forward range scan: keys only, values fetched by a follow-up
/// read. Task `i` owns slots `sum(counts[..i]) .. +counts[i]` of the
/// output, padded with `u64::MAX` keys / `u32::MAX` lengths.
///
/// # Safety
/// As for `kite_read`; `min_keys` and `counts` follow the stride
/// convention.
#[no_mangle]
pub unsafe extern "C" fn kite_scan(
    db: *const KiteDb,
    txn: *mut KiteTxn,
    count: usize,
    cols: *const u64,
    cols_stride: usize,
    min_keys: *const u64,
    min_keys_stride: usize,
    counts: *const u32,
    counts_stride: usize,
    options: u32,
    keys_out: *mut *const u64,
    lens_out: *mut *const u32,
    arena_inout: *mut *mut KiteArena,
    err_out: *mut *mut c_char,
) {
    clear_error(err_out);
    if db.is_null() || min_keys.is_null() || counts.is_null() || keys_out.is_null() || lens_out.is_null()
    {
        export_error(invalid("null handle or pointer argument"), err_out);
        return;
    }
    let Some(options) = decode_options(options, err_out) else {
        return;
    };
    let Some(arena) = arena_mut(arena_inout, err_out) else {
        return;
    };
    let tasks = ScanTasks::new(
        strided(cols.cast::<CollectionId>(), cols_stride, cols_count(cols, count)),
        strided(min_keys.cast::<Key>(), min_keys_stride, count),
        strided(counts, counts_stride, count),
    );
    match (*db).db.scan(txn_opt(txn), &tasks, options, &mut arena.arena) {
        Ok(tape) => {
            *keys_out = tape.keys().as_ptr().cast::<u64>();
            *lens_out = tape.lens().as_ptr();
        }
        Err(error) => export_error(error, err_out),
    }
}

/// Release an arena and every result tape it owns.
///
/// # Safety
/// `arena` must be null or a handle produced by a batch call, not used
/// afterwards.
#[no_mangle]
pub unsafe extern "C" fn kite_arena_free(_db: *const KiteDb, arena: *mut KiteArena) {
    if !arena.is_null() {
        drop(Box::from_raw(arena));
    }
}

/// Collection argument count under the 0/1/N convention: null is 0,
/// anything else carries one element per task (stride 0 broadcasts).
fn cols_count(cols: *const u64, count: usize) -> usize {
    if cols.is_null() {
        0
    } else {
        count
    }
}
