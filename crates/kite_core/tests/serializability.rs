//! Serializability under concurrency.
//!
//! Many transactions run concurrently while every committed one is logged
//! with its assigned sequence number. The log is then replayed from a
//! single thread into a fresh database in ascending sequence order, and
//! both final states must match exactly, the strongest observable check
//! that commit order is a valid serial order.

use std::sync::{Arc, Mutex};
use std::thread;

use kite_core::{
    Arena, CollectionId, Database, Key, Options, ReadTasks, ScanTasks, SeqNo, Strided, WriteOp,
};

const THREADS: usize = 8;
const ITERATIONS: usize = 300;
const MAX_BATCH: usize = 16;
const KEY_SPACE: u64 = (ITERATIONS * MAX_BATCH / 4) as u64;

#[derive(Debug)]
enum Operation {
    Insert { entries: Vec<(u64, u64)> },
    Remove { keys: Vec<u64> },
    Select { observed: Vec<(u64, Option<u64>)> },
}

impl Operation {
    /// Writes sort before the selects that share their sequence: a
    /// read-only commit at snapshot `s` observed the write stamped `s`.
    fn replay_rank(&self) -> u8 {
        match self {
            Operation::Insert { .. } | Operation::Remove { .. } => 0,
            Operation::Select { .. } => 1,
        }
    }
}

type CommitLog = Mutex<Vec<(SeqNo, u8, Operation)>>;

/// Small deterministic generator so failures reproduce byte-for-byte.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 11
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

fn value_bytes(v: u64) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

fn value_from(bytes: &[u8]) -> u64 {
    u64::from_be_bytes(bytes.try_into().expect("stress values are 8 bytes"))
}

fn log_commit(log: &CommitLog, seq: SeqNo, op: Operation) {
    let rank = op.replay_rank();
    log.lock().unwrap().push((seq, rank, op));
}

fn commit_write_batch(db: &Database, ops: Vec<WriteOp>) -> Option<SeqNo> {
    let mut txn = db.begin().ok()?;
    if db.write_buffered(&mut txn, ops, Options::default()).is_err() {
        db.abort(&mut txn);
        return None;
    }
    db.commit(&mut txn, Options::default()).ok()
}

fn insert_worker(db: Arc<Database>, log: Arc<CommitLog>, seed: u64) {
    let mut rng = Lcg(seed);
    for _ in 0..ITERATIONS {
        let batch = 1 + rng.below(MAX_BATCH as u64) as usize;
        let entries: Vec<(u64, u64)> = (0..batch)
            .map(|_| (rng.below(KEY_SPACE), rng.next()))
            .collect();
        let ops: Vec<WriteOp> = entries
            .iter()
            .map(|&(k, v)| WriteOp::put(CollectionId::DEFAULT, Key(k), value_bytes(v)))
            .collect();
        if let Some(seq) = commit_write_batch(&db, ops) {
            log_commit(&log, seq, Operation::Insert { entries });
        }
    }
}

fn remove_worker(db: Arc<Database>, log: Arc<CommitLog>, seed: u64) {
    let mut rng = Lcg(seed);
    for _ in 0..ITERATIONS {
        let batch = 1 + rng.below(MAX_BATCH as u64) as usize;
        let keys: Vec<u64> = (0..batch).map(|_| rng.below(KEY_SPACE)).collect();
        let ops: Vec<WriteOp> = keys
            .iter()
            .map(|&k| WriteOp::delete(CollectionId::DEFAULT, Key(k)))
            .collect();
        if let Some(seq) = commit_write_batch(&db, ops) {
            log_commit(&log, seq, Operation::Remove { keys });
        }
    }
}

fn select_worker(db: Arc<Database>, log: Arc<CommitLog>, seed: u64) {
    let mut rng = Lcg(seed);
    let mut arena = Arena::new();
    for _ in 0..ITERATIONS {
        let batch = 1 + rng.below(MAX_BATCH as u64) as usize;
        let keys: Vec<Key> = (0..batch).map(|_| Key(rng.below(KEY_SPACE))).collect();

        let mut txn = match db.begin() {
            Ok(txn) => txn,
            Err(_) => continue,
        };
        let observed: Vec<(u64, Option<u64>)> = {
            let tape = match db.read(
                Some(&mut txn),
                &ReadTasks::keys_only(&keys),
                Options::default(),
                &mut arena,
            ) {
                Ok(tape) => tape,
                Err(_) => {
                    db.abort(&mut txn);
                    continue;
                }
            };
            keys.iter()
                .enumerate()
                .map(|(i, key)| (key.0, tape.value(i).map(value_from)))
                .collect()
        };
        if let Ok(seq) = db.commit(&mut txn, Options::default()) {
            log_commit(&log, seq, Operation::Select { observed });
        }
    }
}

/// Full key dump of the default collection, paged through the scan tape.
fn dump(db: &Database) -> Vec<(u64, u64)> {
    let mut arena = Arena::new();
    let mut out = Vec::new();
    let mut from = Key(0);
    loop {
        let min_keys = [from];
        let counts = [1024u32];
        let tasks = ScanTasks::new(
            Strided::empty(),
            Strided::from_slice(&min_keys),
            Strided::from_slice(&counts),
        );
        let page: Vec<(u64, u64)> = {
            let tape = db
                .scan(None, &tasks, Options::default(), &mut arena)
                .expect("scan");
            let (keys, _) = tape.task(0);
            let values: Vec<u64> = {
                let mut value_arena = Arena::new();
                let value_tape = db
                    .read(
                        None,
                        &ReadTasks::keys_only(keys),
                        Options::default(),
                        &mut value_arena,
                    )
                    .expect("read scanned keys");
                (0..keys.len())
                    .map(|i| value_from(value_tape.value(i).expect("scanned key present")))
                    .collect()
            };
            keys.iter().map(|k| k.0).zip(values).collect()
        };
        let Some(&(last, _)) = page.last() else {
            break;
        };
        out.extend_from_slice(&page);
        if last == u64::MAX {
            break;
        }
        from = Key(last + 1);
    }
    out
}

#[test]
fn test_serializable_transactions_replay() {
    let db = Arc::new(Database::open("mem:").unwrap());
    let log = Arc::new(CommitLog::default());

    // 30% inserters, 10% removers, the rest read.
    let inserters = (THREADS * 30) / 100;
    let removers = (THREADS / 10).max(1);
    let mut handles = Vec::new();
    for t in 0..THREADS {
        let db = db.clone();
        let log = log.clone();
        let seed = 0x9E37_79B9 + t as u64;
        handles.push(thread::spawn(move || {
            if t < inserters {
                insert_worker(db, log, seed);
            } else if t < inserters + removers {
                remove_worker(db, log, seed);
            } else {
                select_worker(db, log, seed);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Recover the serial order.
    let mut operations = Arc::try_unwrap(log).unwrap().into_inner().unwrap();
    operations.sort_by_key(|&(seq, rank, _)| (seq, rank));
    assert!(
        operations.iter().any(|(_, _, op)| matches!(op, Operation::Insert { .. })),
        "stress must commit at least one insert"
    );

    // Replay sequentially into a fresh database.
    let replay = Database::open("mem:").unwrap();
    for (seq, _, op) in &operations {
        match op {
            Operation::Insert { entries } => {
                let ops: Vec<WriteOp> = entries
                    .iter()
                    .map(|&(k, v)| WriteOp::put(CollectionId::DEFAULT, Key(k), value_bytes(v)))
                    .collect();
                replay.write_ops(&ops, Options::default()).unwrap();
            }
            Operation::Remove { keys } => {
                let ops: Vec<WriteOp> = keys
                    .iter()
                    .map(|&k| WriteOp::delete(CollectionId::DEFAULT, Key(k)))
                    .collect();
                replay.write_ops(&ops, Options::default()).unwrap();
            }
            Operation::Select { observed } => {
                // Every concurrent read must match the serial state.
                let keys: Vec<Key> = observed.iter().map(|&(k, _)| Key(k)).collect();
                let mut arena = Arena::new();
                let tape = replay
                    .read(None, &ReadTasks::keys_only(&keys), Options::default(), &mut arena)
                    .unwrap();
                for (i, &(key, expected)) in observed.iter().enumerate() {
                    assert_eq!(
                        tape.value(i).map(value_from),
                        expected,
                        "select at seq {} disagrees on key {key}",
                        seq.0
                    );
                }
            }
        }
    }

    // Final key-spaces and values must match exactly.
    let concurrent_state = dump(&db);
    let replayed_state = dump(&replay);
    assert_eq!(concurrent_state, replayed_state);
}

#[test]
fn test_watch_discipline_under_interleaving() {
    // P7: when two transactions race on the same watched key, exactly one
    // of each conflicting pair commits, and the survivor's value is the
    // one observable afterwards.
    let db = Arc::new(Database::open("mem:").unwrap());
    let winners = Arc::new(Mutex::new(Vec::<(SeqNo, u64)>::new()));

    let mut handles = Vec::new();
    for t in 0..4u64 {
        let db = db.clone();
        let winners = winners.clone();
        handles.push(thread::spawn(move || {
            for round in 0..200u64 {
                let mut txn = match db.begin() {
                    Ok(txn) => txn,
                    Err(_) => continue,
                };
                let marker = t * 1_000_000 + round;
                let ops = vec![WriteOp::put(
                    CollectionId::DEFAULT,
                    Key(0),
                    value_bytes(marker),
                )];
                if db.write_buffered(&mut txn, ops, Options::default()).is_err() {
                    db.abort(&mut txn);
                    continue;
                }
                if let Ok(seq) = db.commit(&mut txn, Options::default()) {
                    winners.lock().unwrap().push((seq, marker));
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let mut winners = Arc::try_unwrap(winners).unwrap().into_inner().unwrap();
    assert!(!winners.is_empty());
    winners.sort_by_key(|&(seq, _)| seq);

    // Sequence numbers are unique across commits.
    for pair in winners.windows(2) {
        assert!(pair[0].0 < pair[1].0);
    }

    // The highest sequence owns the final value.
    let mut arena = Arena::new();
    let keys = [Key(0)];
    let tape = db
        .read(None, &ReadTasks::keys_only(&keys), Options::default(), &mut arena)
        .unwrap();
    assert_eq!(
        tape.value(0).map(value_from),
        Some(winners.last().unwrap().1)
    );
}
