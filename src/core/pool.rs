// Bounded, lazily grown pool of reusable interpreter instances with blocking checkout.
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::{error, trace};

use crate::core::error::{Error, ErrorKind};

/// Lifecycle hooks the pool drives on the values it owns.
pub trait Instance: Send {
    /// Runs on every release, before the instance rejoins the idle queue.
    fn reset(&mut self) {}

    /// Runs once when the pool discards an idle instance.
    fn close(self)
    where
        Self: Sized,
    {
    }
}

pub type Factory<T> = Box<dyn Fn() -> Result<T, Error> + Send + Sync>;

#[derive(Clone, Copy, Debug)]
pub struct PoolOptions {
    pub size: usize,
}

impl PoolOptions {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub borrowed: usize,
}

struct State<T> {
    idle: VecDeque<T>,
    borrowed: usize,
    retired: bool,
}

pub struct Pool<T: Instance> {
    size: usize,
    open: Factory<T>,
    state: Mutex<State<T>>,
    available: Condvar,
}

impl<T: Instance> Pool<T> {
    pub fn new<F>(options: PoolOptions, open: F) -> Result<Self, Error>
    where
        F: Fn() -> Result<T, Error> + Send + Sync + 'static,
    {
        if options.size == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("pool size must be at least 1"));
        }
        Ok(Self {
            size: options.size,
            open: Box::new(open),
            state: Mutex::new(State {
                idle: VecDeque::new(),
                borrowed: 0,
                retired: false,
            }),
            available: Condvar::new(),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Checks out an idle instance, creating one if under capacity, otherwise
    /// blocks until a loan is returned. Factory errors go to this caller only.
    /// Fails with `NotFound` once the pool is retired, including for waiters.
    pub fn get(&self) -> Result<Loan<'_, T>, Error> {
        let mut state = self.lock();
        loop {
            if state.retired {
                return Err(Error::new(ErrorKind::NotFound).with_message("pool is retired"));
            }
            if let Some(instance) = state.idle.pop_front() {
                state.borrowed += 1;
                return Ok(Loan::new(self, instance));
            }
            if state.borrowed < self.size {
                break;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        // Reserve the slot so the factory can run without holding the lock.
        state.borrowed += 1;
        let borrowed = state.borrowed;
        drop(state);

        match (self.open)() {
            Ok(instance) => {
                trace!(borrowed, size = self.size, "pool grew by one instance");
                Ok(Loan::new(self, instance))
            }
            Err(err) => {
                let mut state = self.lock();
                state.borrowed -= 1;
                drop(state);
                self.available.notify_one();
                Err(err)
            }
        }
    }

    /// Closes every idle instance. Fails while any loan is outstanding; the
    /// pool stays usable afterwards and regrows from zero on the next `get`.
    pub fn close(&self) -> Result<(), Error> {
        self.shutdown(false)
    }

    /// Like `close`, but the pool never hands out another instance: queued
    /// and later `get` calls fail. A `Busy` failure leaves the pool untouched.
    pub fn retire(&self) -> Result<(), Error> {
        self.shutdown(true)
    }

    pub fn is_retired(&self) -> bool {
        self.lock().retired
    }

    fn shutdown(&self, retire: bool) -> Result<(), Error> {
        let mut state = self.lock();
        if state.borrowed > 0 {
            return Err(Error::new(ErrorKind::Busy)
                .with_message(format!(
                    "possible instance leakage, {} instance(s) still borrowed",
                    state.borrowed
                ))
                .with_hint("Retry once in-flight calls have completed."));
        }
        let idle = std::mem::take(&mut state.idle);
        state.retired |= retire;
        drop(state);
        if retire {
            self.available.notify_all();
        }

        let count = idle.len();
        for instance in idle {
            instance.close();
        }
        trace!(closed = count, retire, "pool closed idle instances");
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            size: self.size,
            idle: state.idle.len(),
            borrowed: state.borrowed,
        }
    }

    fn release(&self, mut instance: T) {
        instance.reset();
        let mut state = self.lock();
        if state.borrowed == 0 {
            drop(state);
            error!("instance released with no outstanding loans, discarding it");
            instance.close();
            return;
        }
        state.borrowed -= 1;
        state.idle.push_back(instance);
        drop(state);
        self.available.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Instance> fmt::Display for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        write!(
            f,
            "size: {}, available: {}, borrowed: {}",
            stats.size, stats.idle, stats.borrowed
        )
    }
}

impl<T: Instance> Drop for Pool<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for instance in state.idle.drain(..) {
            instance.close();
        }
    }
}

/// Exclusive use of one pooled instance; returned to its pool on drop.
pub struct Loan<'a, T: Instance> {
    pool: &'a Pool<T>,
    instance: Option<T>,
}

impl<'a, T: Instance> Loan<'a, T> {
    fn new(pool: &'a Pool<T>, instance: T) -> Self {
        Self {
            pool,
            instance: Some(instance),
        }
    }

    pub fn release(self) {
        drop(self);
    }
}

impl<T: Instance> Deref for Loan<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.instance.as_ref().expect("loan already released")
    }
}

impl<T: Instance> DerefMut for Loan<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.instance.as_mut().expect("loan already released")
    }
}

impl<T: Instance> Drop for Loan<'_, T> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.pool.release(instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, Instance, Pool, PoolOptions, PoolStats};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        resets: AtomicUsize,
        closed: AtomicUsize,
    }

    struct Probe {
        counters: Arc<Counters>,
    }

    impl Instance for Probe {
        fn reset(&mut self) {
            self.counters.resets.fetch_add(1, Ordering::SeqCst);
        }

        fn close(self) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn probe_pool(size: usize) -> (Pool<Probe>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let shared = Arc::clone(&counters);
        let pool = Pool::new(PoolOptions::new(size), move || {
            shared.created.fetch_add(1, Ordering::SeqCst);
            Ok(Probe {
                counters: Arc::clone(&shared),
            })
        })
        .expect("pool");
        (pool, counters)
    }

    #[test]
    fn zero_size_is_rejected() {
        let result = Pool::new(PoolOptions::new(0), || {
            Ok(Probe {
                counters: Arc::new(Counters::default()),
            })
        });
        let err = result.err().expect("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn instances_are_created_lazily_and_reused() {
        let (pool, counters) = probe_pool(4);
        assert_eq!(counters.created.load(Ordering::SeqCst), 0);

        let loan = pool.get().expect("get");
        loan.release();
        let loan = pool.get().expect("get");
        drop(loan);

        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(counters.resets.load(Ordering::SeqCst), 2);
        assert_eq!(
            pool.stats(),
            PoolStats {
                size: 4,
                idle: 1,
                borrowed: 0
            }
        );
    }

    #[test]
    fn borrowed_never_exceeds_capacity() {
        let (pool, counters) = probe_pool(3);
        let pool = Arc::new(pool);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for _ in 0..12 {
            let pool = Arc::clone(&pool);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            workers.push(thread::spawn(move || {
                let loan = pool.get().expect("get");
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                active.fetch_sub(1, Ordering::SeqCst);
                drop(loan);
            }));
        }
        for worker in workers {
            worker.join().expect("join");
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(counters.created.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.stats().borrowed, 0);
    }

    #[test]
    fn blocked_get_wakes_on_release() {
        let (pool, _counters) = probe_pool(1);
        let pool = Arc::new(pool);
        let held = pool.get().expect("get");

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let loan = pool.get().expect("get");
                tx.send(()).expect("send");
                drop(loan);
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(held);
        rx.recv_timeout(Duration::from_secs(5)).expect("waiter woke");
        waiter.join().expect("join");
    }

    #[test]
    fn close_without_loans_allows_reuse() {
        let (pool, counters) = probe_pool(2);
        let first = pool.get().expect("get");
        let second = pool.get().expect("get");
        drop(first);
        drop(second);

        pool.close().expect("close");
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().idle, 0);

        pool.close().expect("close again");
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);

        let loan = pool.get().expect("get after close");
        drop(loan);
        assert_eq!(counters.created.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn close_with_outstanding_loan_fails_and_keeps_idle() {
        let (pool, counters) = probe_pool(2);
        let kept = pool.get().expect("get");
        let returned = pool.get().expect("get");
        drop(returned);

        let err = pool.close().expect_err("expected busy");
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 0);

        drop(kept);
        pool.close().expect("close");
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retire_closes_idle_and_refuses_new_loans() {
        let (pool, counters) = probe_pool(2);
        let loan = pool.get().expect("get");
        drop(loan);

        pool.retire().expect("retire");
        assert!(pool.is_retired());
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);

        let err = pool.get().err().expect("expected retired error");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(
            pool.stats(),
            PoolStats {
                size: 2,
                idle: 0,
                borrowed: 0
            }
        );
    }

    #[test]
    fn busy_retire_leaves_pool_usable() {
        let (pool, _counters) = probe_pool(1);
        let held = pool.get().expect("get");

        let err = pool.retire().expect_err("expected busy");
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(!pool.is_retired());

        drop(held);
        let loan = pool.get().expect("get after busy retire");
        drop(loan);
    }

    #[test]
    fn factory_failure_does_not_consume_a_slot() {
        let fail = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&fail);
        let counters = Arc::new(Counters::default());
        let pool = Pool::new(PoolOptions::new(1), move || {
            if flag.swap(false, Ordering::SeqCst) {
                return Err(Error::new(ErrorKind::Script).with_message("boom"));
            }
            Ok(Probe {
                counters: Arc::clone(&counters),
            })
        })
        .expect("pool");

        let err = pool.get().err().expect("expected factory error");
        assert_eq!(err.kind(), ErrorKind::Script);
        assert_eq!(pool.stats().borrowed, 0);

        let loan = pool.get().expect("get after failure");
        assert_eq!(pool.stats().borrowed, 1);
        drop(loan);
    }

    #[test]
    fn display_reports_counts() {
        let (pool, _counters) = probe_pool(5);
        let loan = pool.get().expect("get");
        assert_eq!(pool.to_string(), "size: 5, available: 0, borrowed: 1");
        drop(loan);
        assert_eq!(pool.to_string(), "size: 5, available: 1, borrowed: 0");
    }
}
