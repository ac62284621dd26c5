//! Pre-generated key-agreement contexts.
//!
//! # Design
//!
//! - `ready`: contexts never handed out yet, oldest first.
//! - `issued`: contexts handed to a handshake, kept so that M3 can find the
//!   responder's own exponential again. Bounded by the pool capacity.
//! - `pruned`: the last context evicted from `issued`, still searchable.
//!
//! A context leaves `ready` exactly once, so two handshakes never share
//! one. Generation always happens outside the lock.
//!
//! # Thread Safety
//!
//! One mutex per pool. Refills run through the [`Scheduler`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::collaborators::{NodeSigner, Scheduler};
use crate::error::HandshakeError;
use crate::key_agreement::{KeyAgreementContext, KeyAgreementKind};
use crate::lock_or_recover;

struct PoolInner {
    ready: VecDeque<Arc<KeyAgreementContext>>,
    issued: VecDeque<Arc<KeyAgreementContext>>,
    pruned: Option<Arc<KeyAgreementContext>>,
    last_generation: Option<Instant>,
    refill_pending: bool,
    shut_down: bool,
}

/// Insert `context`, evicting the oldest-by-generation entry past `capacity`.
fn insert_bounded(
    queue: &mut VecDeque<Arc<KeyAgreementContext>>,
    context: Arc<KeyAgreementContext>,
    capacity: usize,
) -> Option<Arc<KeyAgreementContext>> {
    queue.push_back(context);
    if queue.len() <= capacity {
        return None;
    }
    let oldest = queue
        .iter()
        .enumerate()
        .min_by_key(|(_, ctx)| ctx.created_at())
        .map(|(idx, _)| idx)?;
    queue.remove(oldest)
}

pub struct ContextPool {
    kind: KeyAgreementKind,
    capacity: usize,
    generation_interval: Duration,
    signer: Arc<dyn NodeSigner>,
    scheduler: Arc<dyn Scheduler>,
    inner: Mutex<PoolInner>,
}

impl ContextPool {
    pub fn new(
        kind: KeyAgreementKind,
        capacity: usize,
        generation_interval: Duration,
        signer: Arc<dyn NodeSigner>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            kind,
            capacity: capacity.max(1),
            generation_interval,
            signer,
            scheduler,
            inner: Mutex::new(PoolInner {
                ready: VecDeque::with_capacity(capacity),
                issued: VecDeque::with_capacity(capacity),
                pruned: None,
                last_generation: None,
                refill_pending: false,
                shut_down: false,
            }),
        }
    }

    pub fn kind(&self) -> KeyAgreementKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn generate(&self, now: Instant) -> Arc<KeyAgreementContext> {
        Arc::new(KeyAgreementContext::generate(self.kind, self.signer.as_ref(), now))
    }

    /// Fill the ready queue on the caller's thread, then start the periodic
    /// background generation.
    pub fn start(self: &Arc<Self>, now: Instant) {
        self.fill(now);
        self.schedule_periodic_refill();
        info!(
            "{:?} context pool ready with {} contexts",
            self.kind,
            self.ready_len()
        );
    }

    /// Generate until the ready queue is at capacity.
    pub fn fill(&self, now: Instant) {
        let missing = {
            let inner = lock_or_recover(&self.inner);
            if inner.shut_down {
                return;
            }
            self.capacity.saturating_sub(inner.ready.len())
        };

        let fresh: Vec<_> = (0..missing).map(|_| self.generate(now)).collect();

        let mut inner = lock_or_recover(&self.inner);
        if inner.shut_down {
            return;
        }
        for context in fresh {
            insert_bounded(&mut inner.ready, context, self.capacity);
        }
        inner.last_generation = Some(now);
    }

    /// Generate one context; the oldest ready one is dropped if full.
    pub fn refill_one(&self, now: Instant) {
        if lock_or_recover(&self.inner).shut_down {
            return;
        }

        let context = self.generate(now);

        let mut inner = lock_or_recover(&self.inner);
        inner.refill_pending = false;
        if inner.shut_down {
            return;
        }
        insert_bounded(&mut inner.ready, context, self.capacity);
        inner.last_generation = Some(now);
    }

    fn schedule_periodic_refill(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        self.scheduler.schedule(
            self.generation_interval,
            Box::new(move || {
                if pool.is_shut_down() {
                    return;
                }
                pool.refill_one(Instant::now());
                pool.schedule_periodic_refill();
            }),
        );
    }

    fn request_refill(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        self.scheduler
            .execute(Box::new(move || pool.refill_one(Instant::now())));
    }

    /// Hand out the oldest ready context.
    ///
    /// When none is ready, legacy DH generates one on the caller's thread
    /// while ECDH fails with [`HandshakeError::NoContexts`].
    pub fn acquire(self: &Arc<Self>, now: Instant) -> Result<Arc<KeyAgreementContext>, HandshakeError> {
        let (popped, refill) = {
            let mut inner = lock_or_recover(&self.inner);
            if inner.shut_down {
                return Err(HandshakeError::ShuttingDown);
            }
            let popped = inner.ready.pop_front();
            let interval_elapsed = inner
                .last_generation
                .map_or(true, |t| now.saturating_duration_since(t) >= self.generation_interval);
            let refill = !inner.refill_pending
                && (inner.ready.len() * 2 < self.capacity || interval_elapsed);
            if refill {
                inner.refill_pending = true;
            }
            (popped, refill)
        };

        if refill {
            self.request_refill();
        }

        let context = match popped {
            Some(context) => context,
            None if self.kind == KeyAgreementKind::Dh => {
                debug!("DH context pool empty, generating inline");
                self.generate(now)
            }
            None => return Err(HandshakeError::NoContexts(self.kind)),
        };

        let mut inner = lock_or_recover(&self.inner);
        if let Some(evicted) = insert_bounded(&mut inner.issued, Arc::clone(&context), self.capacity) {
            inner.pruned = Some(evicted);
        }
        Ok(context)
    }

    /// Find one of our contexts by its public value.
    pub fn find_by_public_value(&self, public_value: &[u8]) -> Option<Arc<KeyAgreementContext>> {
        let inner = lock_or_recover(&self.inner);
        inner
            .issued
            .iter()
            .chain(inner.ready.iter())
            .chain(inner.pruned.iter())
            .find(|ctx| ctx.public_key_bytes().as_ref() == public_value)
            .cloned()
    }

    pub fn ready_len(&self) -> usize {
        lock_or_recover(&self.inner).ready.len()
    }

    pub fn is_shut_down(&self) -> bool {
        lock_or_recover(&self.inner).shut_down
    }

    /// Drop every context; their secrets are zeroized on drop.
    pub fn shutdown(&self) {
        let mut inner = lock_or_recover(&self.inner);
        inner.shut_down = true;
        inner.ready.clear();
        inner.issued.clear();
        inner.pruned = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeypair;
    use crate::collaborators::Task;
    use std::collections::HashSet;

    #[derive(Default)]
    struct QueueScheduler {
        immediate: Mutex<Vec<Task>>,
        delayed: Mutex<Vec<(Duration, Task)>>,
    }

    impl Scheduler for QueueScheduler {
        fn execute(&self, task: Task) {
            self.immediate.lock().unwrap().push(task);
        }

        fn schedule(&self, delay: Duration, task: Task) {
            self.delayed.lock().unwrap().push((delay, task));
        }
    }

    fn pool(kind: KeyAgreementKind, capacity: usize) -> (Arc<ContextPool>, Arc<QueueScheduler>) {
        let scheduler = Arc::new(QueueScheduler::default());
        let pool = Arc::new(ContextPool::new(
            kind,
            capacity,
            Duration::from_secs(30),
            Arc::new(IdentityKeypair::generate()),
            scheduler.clone(),
        ));
        (pool, scheduler)
    }

    #[test]
    fn test_start_fills_and_schedules() {
        let (pool, scheduler) = pool(KeyAgreementKind::Ecdh, 4);
        pool.start(Instant::now());
        assert_eq!(pool.ready_len(), 4);
        assert_eq!(scheduler.delayed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_acquire_never_repeats_a_context() {
        let (pool, _scheduler) = pool(KeyAgreementKind::Dh, 3);
        let now = Instant::now();
        pool.fill(now);

        let mut seen = HashSet::new();
        for _ in 0..8 {
            let ctx = pool.acquire(now).unwrap();
            assert!(seen.insert(ctx.public_key_bytes().clone()));
        }
    }

    #[test]
    fn test_ecdh_exhaustion_fails_fast() {
        let (pool, scheduler) = pool(KeyAgreementKind::Ecdh, 2);
        let now = Instant::now();
        pool.fill(now);

        pool.acquire(now).unwrap();
        pool.acquire(now).unwrap();
        assert!(matches!(
            pool.acquire(now),
            Err(HandshakeError::NoContexts(KeyAgreementKind::Ecdh))
        ));
        // A refill was requested off-thread.
        let tasks: Vec<Task> = scheduler.immediate.lock().unwrap().drain(..).collect();
        assert!(!tasks.is_empty());
        for task in tasks {
            task();
        }
        assert!(pool.acquire(now).is_ok());
    }

    #[test]
    fn test_only_most_recent_pruned_is_findable() {
        let (pool, _scheduler) = pool(KeyAgreementKind::Ecdh, 2);
        let start = Instant::now();

        let mut issued = Vec::new();
        for i in 0..4u64 {
            let now = start + Duration::from_millis(i);
            pool.refill_one(now);
            issued.push(pool.acquire(now).unwrap());
        }

        // Capacity 2: the last two are issued, the second is pruned, the
        // first is gone.
        assert!(pool.find_by_public_value(issued[3].public_key_bytes()).is_some());
        assert!(pool.find_by_public_value(issued[2].public_key_bytes()).is_some());
        assert!(pool.find_by_public_value(issued[1].public_key_bytes()).is_some());
        assert!(pool.find_by_public_value(issued[0].public_key_bytes()).is_none());
    }

    #[test]
    fn test_shutdown_clears_everything() {
        let (pool, _scheduler) = pool(KeyAgreementKind::Ecdh, 2);
        let now = Instant::now();
        pool.fill(now);
        let ctx = pool.acquire(now).unwrap();

        pool.shutdown();
        assert_eq!(pool.ready_len(), 0);
        assert!(pool.find_by_public_value(ctx.public_key_bytes()).is_none());
        assert!(matches!(pool.acquire(now), Err(HandshakeError::ShuttingDown)));
    }
}
