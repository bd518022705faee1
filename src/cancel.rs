use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct State {
    cancelled: bool,
    children: Vec<Weak<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    cv: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A clonable cancellation signal. All clones observe the same state; once
/// cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct Cancel {
    inner: Arc<Inner>,
}

impl Cancel {
    pub fn new() -> Cancel {
        Cancel::default()
    }

    /// Fires the signal, wakes every pending [`Cancel::wait`] and cancels
    /// every attached child.
    pub fn cancel(&self) {
        let children = {
            let mut st = self.inner.lock();
            st.cancelled = true;
            std::mem::take(&mut st.children)
        };

        self.inner.cv.notify_all();
        for c in children.iter().filter_map(Weak::upgrade) {
            Cancel { inner: c }.cancel();
        }
    }

    /// Makes `child` fire whenever `self` does. If `self` is already
    /// cancelled, `child` is cancelled now. Only a weak link is kept.
    pub fn attach(&self, child: &Cancel) {
        {
            let mut st = self.inner.lock();
            if !st.cancelled {
                st.children.retain(|w| w.strong_count() > 0);
                st.children.push(Arc::downgrade(&child.inner));
                return;
            }
        }

        child.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Sleeps for `d` unless cancelled first. Returns true if cancelled.
    pub fn wait(&self, d: Duration) -> bool {
        let deadline = Instant::now().checked_add(d);
        let mut st = self.inner.lock();
        while !st.cancelled {
            st = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }

                    match self.inner.cv.wait_timeout(st, deadline - now) {
                        Ok((g, _)) => g,
                        Err(e) => e.into_inner().0,
                    }
                }
                // Too far out to represent; only a cancel ends it.
                None => self.inner.cv.wait(st).unwrap_or_else(|e| e.into_inner()),
            };
        }

        st.cancelled
    }
}
