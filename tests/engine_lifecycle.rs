//! Engine facade: scans, snapshots, persistence and maintenance

use photonkv::storage::{OrderedStore, ReadOptions};
use photonkv::{Context, Engine, Options};

fn options() -> Options {
    Options {
        start_reclaimer: false,
        ..Options::default()
    }
}

fn open(dir: &tempfile::TempDir) -> Engine {
    Engine::open(options(), dir.path()).expect("Failed to open engine")
}

fn fill(engine: &Engine, keys: &[&str]) {
    for key in keys {
        engine.raw_set(key.as_bytes(), b"v").expect("raw_set");
    }
}

fn scan(iter: impl Iterator<Item = (Vec<u8>, Vec<u8>)>) -> Vec<String> {
    iter.map(|(key, _)| String::from_utf8(key).expect("utf8"))
        .collect()
}

#[test]
fn test_forward_bounds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open(&dir);
    fill(&engine, &["a", "b", "c", "d"]);

    assert_eq!(scan(engine.iterator(b"b", b"d", -1, None)), ["b", "c"]);
    assert_eq!(scan(engine.iterator(b"", b"", 2, None)), ["a", "b"]);
    assert!(scan(engine.iterator(b"a", b"z", 0, None)).is_empty());
    assert_eq!(scan(engine.iterator(b"bb", b"", -1, None)), ["c", "d"]);
}

#[test]
fn test_backward_bounds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open(&dir);
    fill(&engine, &["a", "b", "c", "d"]);

    assert_eq!(scan(engine.rev_iterator(b"c", b"a", -1, None)), ["c", "b"]);
    assert_eq!(scan(engine.rev_iterator(b"", b"", -1, None)), ["d", "c", "b", "a"]);
    assert_eq!(scan(engine.rev_iterator(b"bb", b"", 1, None)), ["b"]);
}

#[test]
fn test_snapshot_scan_ignores_later_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open(&dir);
    fill(&engine, &["a", "b"]);

    let snapshot = engine.get_snapshot();
    fill(&engine, &["c"]);
    engine.raw_del(b"a").expect("raw_del");

    assert_eq!(scan(engine.iterator(b"", b"", -1, Some(&snapshot))), ["a", "b"]);
    assert_eq!(scan(engine.iterator(b"", b"", -1, None)), ["b", "c"]);
    engine.release_snapshot(snapshot);
}

#[test]
fn test_scans_do_not_fill_cache() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open(&dir);
    fill(&engine, &["a", "b", "c"]);

    let _ = scan(engine.iterator(b"", b"", -1, None));
    assert_eq!(engine.store().cache_stats().size, 0);

    let filled = engine.iterator_with(b"", b"", -1, &ReadOptions::new());
    assert_eq!(scan(filled), ["a", "b", "c"]);
    assert_eq!(engine.store().cache_stats().size, 3);
}

#[test]
fn test_reopen_recovers_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let engine = open(&dir);
        let mut ctx = Context::local();
        engine.put_string(&mut ctx, b"greeting", b"hello").expect("put");
        fill(&engine, &["raw"]);
        // Dropped without close: the log alone must bring the data back
    }

    let engine = open(&dir);
    assert_eq!(
        engine.get_string(b"greeting").expect("get"),
        Some(b"hello".to_vec())
    );
    assert_eq!(engine.raw_get(b"raw").expect("get"), Some(b"v".to_vec()));
}

#[test]
fn test_flush_all_counts_keys() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine: Engine = Engine::open(
        Options {
            flush_batch_size: 2,
            ..options()
        },
        dir.path(),
    )
    .expect("Failed to open engine");
    fill(&engine, &["a", "b", "c", "d", "e"]);

    let deleted = engine.flush_all(&mut Context::local()).expect("flush_all");
    assert_eq!(deleted, 5);
    assert_eq!(engine.size(), 0);
    assert!(scan(engine.iterator(b"", b"", -1, None)).is_empty());
}

#[test]
fn test_save_and_list_backups() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine: Engine = Engine::open(
        Options {
            backup_keep: 1,
            ..options()
        },
        dir.path(),
    )
    .expect("Failed to open engine");
    fill(&engine, &["a", "b"]);

    let first = engine.save().expect("save");
    assert_eq!(first.num_keys, 2);
    fill(&engine, &["c"]);
    let second = engine.save().expect("save");
    assert!(second.id > first.id);
    assert_eq!(second.num_keys, 3);

    let ids: Vec<u32> = engine.backups().expect("backups").iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![second.id]);
    assert!(engine.backup_dir().join(second.id.to_string()).is_dir());
    assert!(!engine.backup_dir().join(first.id.to_string()).exists());
}

#[test]
fn test_info_and_compact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open(&dir);
    fill(&engine, &["a", "b"]);

    let info = engine.info();
    let lookup = |name: &str| {
        info.iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    };
    assert_eq!(lookup("photonkv.estimate-num-keys").as_deref(), Some("2"));
    assert_eq!(lookup("reclaim.running").as_deref(), Some("false"));
    assert_eq!(lookup("reclaim.queue").as_deref(), Some("0"));

    engine.compact().expect("compact");
    assert_eq!(engine.size(), 2);
    assert_eq!(
        engine.store().approximate_len(photonkv::storage::ColumnFamily::Default),
        2
    );
}

#[test]
fn test_reclaimer_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open(&dir);
    assert!(!engine.reclaimer_running());

    engine.start_reclaimer().expect("start");
    engine.start_reclaimer().expect("second start is a no-op");
    assert!(engine.reclaimer_running());

    engine.stop_reclaimer();
    assert!(!engine.reclaimer_running());
    engine.close().expect("close");
}
