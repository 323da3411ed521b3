//! Session construction and recycling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use echokit_core::{Executor, ServerError};
use parking_lot::Mutex;

use crate::config::SessionConfig;
use crate::session::Session;

/// Builds sessions for a manager and takes finished ones back.
///
/// `create` may fail with [`ServerError::NoMemory`]; the manager treats
/// that as a reason to pause admission until a running session finishes.
pub trait SessionFactory: Send + Sync {
    fn create(&self, config: &SessionConfig) -> Result<Session, ServerError>;
    fn release(&self, session: Session);
}

/// All sessions share one executor; finished sessions are kept in a
/// bounded LIFO pool.
pub struct SimpleSessionFactory {
    executor: Executor,
    recycled: Mutex<Vec<Session>>,
    max_recycled: usize,
}

impl SimpleSessionFactory {
    pub fn new(executor: Executor, max_recycled: usize) -> Self {
        Self {
            executor,
            recycled: Mutex::new(Vec::new()),
            max_recycled,
        }
    }
}

impl SessionFactory for SimpleSessionFactory {
    fn create(&self, config: &SessionConfig) -> Result<Session, ServerError> {
        if let Some(session) = self.recycled.lock().pop() {
            return Ok(session);
        }
        Ok(Session::new(&self.executor, config, 0))
    }

    fn release(&self, session: Session) {
        let mut pool = self.recycled.lock();
        if pool.len() < self.max_recycled {
            pool.push(session);
        }
    }
}

struct ExecutorPool {
    executor: Executor,
    recycled: Mutex<Vec<Session>>,
}

/// One recycle pool per executor; fresh sessions round-robin across the
/// executors, released sessions go back to their home pool.
pub struct RoundRobinSessionFactory {
    pools: Vec<ExecutorPool>,
    max_recycled_per_pool: usize,
    next: AtomicUsize,
}

impl RoundRobinSessionFactory {
    /// `max_recycled` is split evenly (rounded up) across the pools.
    ///
    /// # Panics
    ///
    /// Panics if `executors` is empty.
    pub fn new(executors: Vec<Executor>, max_recycled: usize) -> Self {
        assert!(!executors.is_empty(), "at least one executor is required");
        let max_recycled_per_pool = max_recycled.div_ceil(executors.len());
        Self {
            pools: executors
                .into_iter()
                .map(|executor| ExecutorPool {
                    executor,
                    recycled: Mutex::new(Vec::new()),
                })
                .collect(),
            max_recycled_per_pool,
            next: AtomicUsize::new(0),
        }
    }
}

impl SessionFactory for RoundRobinSessionFactory {
    fn create(&self, config: &SessionConfig) -> Result<Session, ServerError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.pools.len();
        let pool = &self.pools[index];
        if let Some(session) = pool.recycled.lock().pop() {
            return Ok(session);
        }
        Ok(Session::new(&pool.executor, config, index))
    }

    fn release(&self, session: Session) {
        let pool = &self.pools[session.home() % self.pools.len()];
        let mut recycled = pool.recycled.lock();
        if recycled.len() < self.max_recycled_per_pool {
            recycled.push(session);
        }
    }
}

/// Wrap any factory with `Arc` so the manager can share it.
pub type SharedSessionFactory = Arc<dyn SessionFactory>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn simple_factory_reuses_released_sessions() {
        let factory = SimpleSessionFactory::new(Executor::current(), 1);
        let config = SessionConfig::default();

        let first = factory.create(&config).unwrap();
        factory.release(first);
        assert_eq!(factory.recycled.lock().len(), 1);

        let _reused = factory.create(&config).unwrap();
        assert_eq!(factory.recycled.lock().len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn simple_factory_drops_overflow() {
        let factory = SimpleSessionFactory::new(Executor::current(), 1);
        let config = SessionConfig::default();

        let first = factory.create(&config).unwrap();
        let second = factory.create(&config).unwrap();
        factory.release(first);
        factory.release(second);
        assert_eq!(factory.recycled.lock().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn round_robin_spreads_sessions_across_executors() {
        let executors = vec![Executor::current(), Executor::current(), Executor::current()];
        let factory = RoundRobinSessionFactory::new(executors, 3);
        let config = SessionConfig::default();

        let homes: Vec<usize> = (0..6)
            .map(|_| factory.create(&config).unwrap().home())
            .collect();
        assert_eq!(homes, vec![0, 1, 2, 0, 1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn round_robin_releases_to_the_home_pool() {
        let executors = vec![Executor::current(), Executor::current()];
        let factory = RoundRobinSessionFactory::new(executors, 4);
        let config = SessionConfig::default();

        let a = factory.create(&config).unwrap();
        let b = factory.create(&config).unwrap();
        assert_eq!(a.home(), 0);
        assert_eq!(b.home(), 1);

        factory.release(b);
        assert_eq!(factory.pools[0].recycled.lock().len(), 0);
        assert_eq!(factory.pools[1].recycled.lock().len(), 1);

        factory.release(a);
        assert_eq!(factory.pools[0].recycled.lock().len(), 1);
    }
}
