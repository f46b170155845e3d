//! Trylock semantics on a single-core machine, where every thread shares
//! one leaf: a held leaf answers busy instead of blocking.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::OnceLock;
use std::time::Duration;

use treesync::{Error, Mutex, TOPOLOGY_FILE_ENV};

fn setup_topology() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        let path = std::env::temp_dir().join("treesync-try-1x1x1.cfg");
        std::fs::write(&path, "s 1,1,1\nn 0\nc 0\n").unwrap();
        std::env::set_var(TOPOLOGY_FILE_ENV, &path);
    });
}

static LOCK: Mutex = Mutex::new();
/// 0 idle, 1 holder inside, 2 holder may release
static PHASE: AtomicUsize = AtomicUsize::new(0);

fn holder(_arg: usize) {
    let guard = LOCK.lock().unwrap();
    PHASE.store(1, SeqCst);
    while PHASE.load(SeqCst) != 2 {
        std::thread::yield_now();
    }
    guard.unlock().unwrap();
}

#[test]
fn try_lock_reports_busy_leaf() {
    setup_topology();
    let h = treesync::spawn(holder, 0).unwrap();
    while PHASE.load(SeqCst) != 1 {
        std::thread::yield_now();
    }

    assert!(LOCK.try_lock().unwrap().is_none());

    PHASE.store(2, SeqCst);
    h.join().unwrap();

    let guard = LOCK.try_lock().unwrap().expect("released lock must be free");
    guard.unlock().unwrap();
}

#[test]
fn declared_but_unimplemented_operations() {
    setup_topology();
    match LOCK.lock_timeout(Duration::from_millis(1)) {
        Err(Error::NotImplemented) => {}
        other => panic!("timed lock must refuse, got {:?}", other.map(|_| ())),
    }
    assert_eq!(LOCK.destroy(), Err(Error::NotImplemented));
}
