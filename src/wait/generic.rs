//! Emulation of the wait-on-word facility for hosts without a native one.
//!
//! Sleepers queue in a small hashtable of buckets keyed by word address,
//! each carrying a one-shot condvar-backed [`Sleeper`] on its own stack.
//! The bucket lock makes the expected-value check and the queue insert
//! atomic with respect to wakers, so no wake-up can be lost. Requeueing
//! re-keys queued records to the destination word without waking them.

use crate::loom::Cell;
use crate::loom::{Condvar, Mutex, MutexGuard};

use core::ptr::{self, NonNull};
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering::Acquire;

use crate::error::Result;

pub(crate) fn wait(addr: &AtomicU32, expected: u32) {
    let key = addr as *const AtomicU32 as usize;
    park(key, || addr.load(Acquire) == expected);
}

pub(crate) fn wake(addr: &AtomicU32, count: u32) -> Result<usize> {
    Ok(unpark_some(addr as *const AtomicU32 as usize, count as usize))
}

pub(crate) fn requeue(src: &AtomicU32, wake: u32, dst: &AtomicU32, limit: u32) -> Result<usize> {
    Ok(requeue_some(
        src as *const AtomicU32 as usize,
        wake as usize,
        dst as *const AtomicU32 as usize,
        limit as usize,
    ))
}

/// The portable stand-in for one kernel wait-queue entry.
///
/// A record lives on its thread's stack for exactly one park episode and
/// is released at most once. A waker may run [`release`](Self::release)
/// before the sleeping thread has reached [`sleep`](Self::sleep), since
/// the queue insert and the wake race outside the bucket lock, so the
/// flag has to hold the wake-up until the sleeper arrives.
struct Sleeper {
    released: Mutex<bool>,
    wake: Condvar,
}

impl Sleeper {
    #[cfg(not(loom))]
    const fn new() -> Self {
        Self {
            released: Mutex::new(false),
            wake: Condvar::new(),
        }
    }
    #[cfg(loom)]
    fn new() -> Self {
        Self {
            released: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    fn sleep(&self) {
        // the flag mutex is never held across user code, so poisoning
        // would mean a panic inside this module itself
        let mut released = self.released.lock().expect("sleeper flag poisoned");
        while !*released {
            released = self.wake.wait(released).expect("sleeper flag poisoned");
        }
    }

    fn release(&self) {
        // single-shot: records are unlinked before release, so nothing
        // rearms the flag
        *self.released.lock().expect("sleeper flag poisoned") = true;
        self.wake.notify_one();
    }
}

#[repr(C)]
struct ThreadData {
    // `next` must stay the first field: list tails are tracked as
    // `*const Cell<*const ThreadData>` and a ThreadData pointer must
    // convert to the address of its own link.
    next: Cell<*const ThreadData>,
    addr: Cell<usize>,
    sleeper: Sleeper,
}

struct Bucket {
    first: Cell<*const ThreadData>,
    last: Cell<*const ThreadData>,
}

unsafe impl Send for Bucket {}

fn park(addr: usize, expected: impl FnOnce() -> bool) {
    let bucket = lock_bucket(addr);
    if !expected() {
        return;
    }

    let thread_data = &ThreadData {
        next: Cell::new(ptr::null()),
        addr: Cell::new(addr),
        sleeper: Sleeper::new(),
    };

    if bucket.first.get().is_null() {
        bucket.first.set(thread_data);
    } else {
        //SAFETY: last isn't null if first isn't null
        unsafe {
            #[cfg(not(loom))]
            debug_assert!(!bucket.last.get().is_null());
            #[cfg(loom)]
            assert!(!bucket.last.get().is_null());
            &*bucket.last.get()
        }
        .next
        .set(thread_data);
    }
    bucket.last.set(thread_data);
    // sleeping with the bucket lock held would deadlock
    drop(bucket);

    thread_data.sleeper.sleep();
}

/// An unlink cursor over a locked bucket's queue plus an accumulator list.
///
/// The accumulator reuses the records' own `next` links, so it is only
/// valid while the records stay unlinked from every bucket.
struct TakenList {
    head: Cell<*const ThreadData>,
    tail: NonNull<Cell<*const ThreadData>>,
    last: *const ThreadData,
}

impl TakenList {
    fn new() -> Self {
        Self {
            head: Cell::new(ptr::null()),
            tail: NonNull::dangling(),
            last: ptr::null(),
        }
    }

    /// # Safety: `entry` must be unlinked from its bucket and unreachable
    /// by any other thread.
    unsafe fn push(&mut self, entry: *const ThreadData) {
        if self.last.is_null() {
            self.head.set(entry);
        } else {
            unsafe { (*self.last).next.set(entry) };
        }
        self.tail = NonNull::from(unsafe { &(*entry).next });
        self.last = entry;
    }

    /// # Safety: every record in the list must still be alive, which holds
    /// because sleeping threads cannot destroy their ThreadData.
    unsafe fn unpark_all(self) -> usize {
        let mut woken = 0;
        let mut current = self.head.get();
        while !current.is_null() {
            unsafe {
                let next = (*current).next.get();
                (*current).sleeper.release();
                woken += 1;
                // `ThreadData` is repr(C) with `next` first, so the record
                // pointer doubles as the address of its link cell.
                if ptr::eq(current as *const Cell<_>, self.tail.as_ptr()) {
                    break;
                }
                // *current may be destroyed now, but is no longer accessed.
                current = next;
            }
        }
        woken
    }
}

fn unpark_some(addr: usize, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    let bucket = lock_bucket(addr);
    let mut wake_list = TakenList::new();
    let mut remaining = count;

    let mut current = bucket.first.get();
    let mut previous = ptr::null();
    /*SAFETY:
     * - sleeping threads can't destroy their ThreadData.
     * - the bucket is locked, so threads can't be unlinked by others.
     * So, if `*const ThreadData` isn't null, then it's safe to dereference.
     */
    unsafe {
        while !current.is_null() {
            let next = (*current).next.get();
            if (*current).addr.get() == addr {
                // fix tail if needed, goes first to deduce `previous`
                if current == bucket.last.get() {
                    bucket.last.set(previous);
                }
                if previous.is_null() {
                    bucket.first.set(next);
                } else {
                    (*previous).next.set(next);
                }
                wake_list.push(current);

                remaining -= 1;
                if remaining == 0 {
                    break;
                }
            } else {
                previous = current;
            }
            current = next;
        }
    }
    drop(bucket);

    if wake_list.last.is_null() {
        return 0;
    }
    //SAFETY: the records are unlinked and their threads still sleep.
    unsafe { wake_list.unpark_all() }
}

fn requeue_some(src: usize, wake_n: usize, dst: usize, limit: usize) -> usize {
    if src == dst || limit == 0 {
        return unpark_some(src, wake_n);
    }

    let (src_bucket, dst_bucket) = lock_bucket_pair(src, dst);
    let mut wake_list = TakenList::new();
    let mut move_list = TakenList::new();
    let mut to_wake = wake_n;
    let mut to_move = limit;

    let mut current = src_bucket.first.get();
    let mut previous = ptr::null();
    //SAFETY: same argument as `unpark_some`; both buckets are locked.
    unsafe {
        while !current.is_null() {
            let next = (*current).next.get();
            if (*current).addr.get() == src {
                if current == src_bucket.last.get() {
                    src_bucket.last.set(previous);
                }
                if previous.is_null() {
                    src_bucket.first.set(next);
                } else {
                    (*previous).next.set(next);
                }

                if to_wake > 0 {
                    to_wake -= 1;
                    wake_list.push(current);
                } else {
                    to_move -= 1;
                    (*current).addr.set(dst);
                    move_list.push(current);
                    if to_move == 0 {
                        break;
                    }
                }
            } else {
                previous = current;
            }
            current = next;
        }
    }

    // splice the moved records into the destination queue, asleep
    if !move_list.last.is_null() {
        let target = dst_bucket.as_ref().unwrap_or(&src_bucket);
        unsafe {
            move_list.tail.as_ref().set(ptr::null());
            if target.first.get().is_null() {
                target.first.set(move_list.head.get());
            } else {
                (*target.last.get()).next.set(move_list.head.get());
            }
            target.last.set(move_list.last);
        }
    }
    drop(dst_bucket);
    drop(src_bucket);

    if wake_list.last.is_null() {
        return 0;
    }
    //SAFETY: the woken records are unlinked and their threads still sleep.
    unsafe { wake_list.unpark_all() }
}

// allows up to 32 different addresses under loom
const BUCKET_BITS: usize = 5;
const BUCKET_COUNT: usize = 1 << BUCKET_BITS;

// Starting from Intel's Sandy Bridge the spatial prefetcher pulls pairs of
// 64-byte cache lines, and several non-x86 server parts use 128-byte lines,
// so buckets are padded to 128 bytes on the 64-bit server architectures and
// to a single 64-byte line elsewhere.
#[cfg_attr(
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    ),
    repr(align(128))
)]
#[cfg_attr(
    not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    )),
    repr(align(64))
)]
struct Slot(Mutex<Bucket>);

struct Hashtable {
    buckets: [Slot; BUCKET_COUNT],
}

impl Hashtable {
    #[cfg(not(loom))]
    const fn new() -> Self {
        const INIT: Slot = Slot(Mutex::new(Bucket {
            first: Cell::new(ptr::null()),
            last: Cell::new(ptr::null()),
        }));
        Self {
            buckets: [INIT; BUCKET_COUNT],
        }
    }

    #[cfg(loom)]
    fn new() -> Self {
        Self {
            buckets: core::array::from_fn(|_| {
                Slot(Mutex::new(Bucket {
                    first: Cell::new(ptr::null()),
                    last: Cell::new(ptr::null()),
                }))
            }),
        }
    }

    fn lock(&self, index: usize) -> MutexGuard<'_, Bucket> {
        //SAFETY: `hash` returns values in [0, BUCKET_COUNT)
        unsafe {
            debug_assert!(index < BUCKET_COUNT);
            self.buckets.get_unchecked(index)
        }
        .0
        .lock()
        .expect("a previous parked thread panicked in its `expected` check")
    }

    #[cfg(loom)]
    fn hash(n: usize) -> usize {
        use std::cell::RefCell;
        struct AddrMap {
            addrs: [usize; BUCKET_COUNT],
            count: usize,
        }

        impl AddrMap {
            fn to_index(&mut self, addr: usize) -> usize {
                let end = self.count;
                for (i, a) in self.addrs[0..end].iter().enumerate() {
                    if *a == addr {
                        return i;
                    }
                }
                assert_ne!(
                    end, BUCKET_COUNT,
                    "[treesync] can't use more than {BUCKET_COUNT} different addresses in loom tests"
                );
                self.count += 1;
                self.addrs[end] = addr;
                end
            }
        }

        loom::lazy_static!(static ref MAP: RefCell<AddrMap> = RefCell::new(AddrMap {
            addrs: [0; BUCKET_COUNT],
            count: 0,
        }););
        MAP.borrow_mut().to_index(n)
    }

    #[cfg(not(loom))]
    fn hash(n: usize) -> usize {
        #[cfg(target_pointer_width = "64")]
        return n.wrapping_mul(0x9E3779B97F4A7C15) >> (64 - BUCKET_BITS);
        #[cfg(target_pointer_width = "32")]
        return n.wrapping_mul(0x9E3779B9) >> (32 - BUCKET_BITS);
        #[cfg(not(any(target_pointer_width = "64", target_pointer_width = "32")))]
        (0..BUCKET_BITS).fold(0, |h, i| h | (n >> i) & (1 << i))
    }
}

fn table() -> &'static Hashtable {
    #[cfg(not(loom))]
    {
        static TABLE: Hashtable = Hashtable::new();
        &TABLE
    }
    #[cfg(loom)]
    {
        loom::lazy_static!(static ref TABLE: Hashtable = Hashtable::new(););
        &*TABLE
    }
}

fn lock_bucket(addr: usize) -> MutexGuard<'static, Bucket> {
    table().lock(Hashtable::hash(addr))
}

/// Locks the buckets of both addresses in index order. The first guard is
/// always `src`'s bucket; the second is `None` when both words share one.
fn lock_bucket_pair(
    src: usize,
    dst: usize,
) -> (MutexGuard<'static, Bucket>, Option<MutexGuard<'static, Bucket>>) {
    let s = Hashtable::hash(src);
    let d = Hashtable::hash(dst);
    let table = table();
    if s == d {
        (table.lock(s), None)
    } else if s < d {
        let src_guard = table.lock(s);
        let dst_guard = table.lock(d);
        (src_guard, Some(dst_guard))
    } else {
        let dst_guard = table.lock(d);
        let src_guard = table.lock(s);
        (src_guard, Some(dst_guard))
    }
}

#[cfg(all(test, loom))]
mod tests {
    use super::{park, requeue_some, unpark_some, Sleeper};
    use loom::cell::Cell;
    use loom::sync::atomic::AtomicUsize;
    use loom::thread;
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::Arc;

    #[test]
    fn sleeper_keeps_an_early_release() {
        loom::model(|| {
            let sleeper = Sleeper::new();
            sleeper.release();
            sleeper.sleep();
        });
    }

    #[test]
    fn sleeper_publishes_the_releasers_writes() {
        loom::model(|| {
            loom::lazy_static! {
                static ref WROTE: Cell<bool> = Cell::new(false);
            }
            let sleeper = Arc::new(Sleeper::new());
            {
                let sleeper = sleeper.clone();
                thread::spawn(move || {
                    WROTE.set(true);
                    sleeper.release();
                });
            }
            sleeper.sleep();
            assert!(WROTE.get());
        });
    }

    #[test]
    fn sleeper_survives_release_through_a_raw_pointer() {
        // the table releases records through `*const ThreadData` into
        // another thread's stack; the record must stay usable until the
        // sleeper returns
        loom::model(|| {
            use core::sync::atomic::Ordering::{Acquire, Release};
            use loom::sync::atomic::AtomicPtr;
            loom::lazy_static! {
                static ref SLOT: AtomicPtr<Sleeper> = AtomicPtr::new(core::ptr::null_mut());
            }
            let h = thread::spawn(|| {
                let sleeper = Sleeper::new();
                SLOT.store(&sleeper as *const _ as *mut _, Release);
                sleeper.sleep();
            });
            let mut sleeper = SLOT.load(Acquire);
            while sleeper.is_null() {
                thread::yield_now();
                sleeper = SLOT.load(Acquire);
            }
            unsafe { &*(sleeper as *const Sleeper) }.release();
            h.join().unwrap();
        });
    }

    #[test]
    fn unpark_one() {
        loom::model(|| {
            let arc = Arc::new(AtomicUsize::new(0));

            {
                let arc = arc.clone();
                thread::spawn(move || {
                    arc.store(1, Relaxed);
                    unpark_some(0, 1);
                });
            }
            park(0, || arc.load(Relaxed) == 0);
            assert_eq!(arc.load(Relaxed), 1);
        });
    }

    #[test]
    fn unpark_all() {
        loom::model(|| {
            let arc = Arc::new(AtomicUsize::new(0));
            let h1 = {
                let arc = arc.clone();
                thread::spawn(move || {
                    park(0, || arc.load(Relaxed) == 0);
                    assert_eq!(arc.load(Relaxed), 1);
                })
            };
            let h2 = {
                let arc = arc.clone();
                thread::spawn(move || {
                    park(0, || arc.load(Relaxed) == 0);
                    assert_eq!(arc.load(Relaxed), 1);
                })
            };
            arc.store(1, Relaxed);
            unpark_some(0, usize::MAX);
            h1.join().unwrap();
            h2.join().unwrap();
        });
    }

    #[test]
    fn distinct_addresses_stay_independent() {
        loom::model(|| {
            let arc1 = Arc::new(AtomicUsize::new(0));
            let arc2 = Arc::new(AtomicUsize::new(0));
            {
                let arc1 = arc1.clone();
                thread::spawn(move || {
                    arc1.store(1, Relaxed);
                    unpark_some(0, 1);
                });
            }
            {
                let arc2 = arc2.clone();
                thread::spawn(move || {
                    arc2.store(1, Relaxed);
                    unpark_some(2, 1);
                });
            }
            park(0, || arc1.load(Relaxed) == 0);
            assert_eq!(arc1.load(Relaxed), 1);
            park(2, || arc2.load(Relaxed) == 0);
            assert_eq!(arc2.load(Relaxed), 1);
        });
    }

    #[test]
    fn requeue_hands_sleepers_to_the_destination() {
        loom::model(|| {
            let arc = Arc::new(AtomicUsize::new(0));
            let h = {
                let arc = arc.clone();
                thread::spawn(move || {
                    park(0, || arc.load(Relaxed) == 0);
                    assert_eq!(arc.load(Relaxed), 1);
                })
            };
            arc.store(1, Relaxed);
            // move without waking, then wake on the destination word
            requeue_some(0, 0, 2, usize::MAX);
            unpark_some(2, 1);
            h.join().unwrap();
        });
    }

    #[test]
    fn requeue_wakes_its_quota_first() {
        loom::model(|| {
            let arc = Arc::new(AtomicUsize::new(0));
            let h = {
                let arc = arc.clone();
                thread::spawn(move || {
                    park(0, || arc.load(Relaxed) == 0);
                    assert_eq!(arc.load(Relaxed), 1);
                })
            };
            arc.store(1, Relaxed);
            requeue_some(0, 1, 2, usize::MAX);
            h.join().unwrap();
        });
    }
}
