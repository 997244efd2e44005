//! Bounded task execution.
//!
//! A [`WorkPool`] runs submitted futures on the tokio runtime while
//! capping how many are in flight. Health checks go through a shared
//! pool so an agent with many containers cannot starve the node with
//! check subprocesses.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::Error;

/// Bounded executor: at most `size` submitted futures run concurrently;
/// the rest wait their turn in submission order.
#[derive(Clone)]
pub struct WorkPool {
    semaphore: Arc<Semaphore>,
}

impl WorkPool {
    pub fn new(size: usize) -> Result<Self, Error> {
        if size == 0 {
            return Err(Error::InvalidConfiguration(
                "work pool size must be positive".to_string(),
            ));
        }

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(size)),
        })
    }

    /// Schedules `work` to run once a slot frees up. Returns immediately.
    pub fn submit<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            // Closed is unreachable: the pool never closes its semaphore.
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("work pool semaphore closed");
            work.await;
        });
    }
}
