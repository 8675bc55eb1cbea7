use std::sync::Arc;

use tokio::sync::Barrier;

use super::Agent;

/// An in-process group of workers rendezvousing on a shared `tokio` barrier.
#[derive(Debug, Clone)]
pub struct BarrierAgent {
    rank: usize,
    world_size: usize,
    barrier: Arc<Barrier>,
}

impl BarrierAgent {
    /// Creates the agents of a whole group.
    ///
    /// # Arguments
    /// * `world_size` - The amount of workers in the group.
    ///
    /// # Returns
    /// One agent per rank, in rank order.
    pub fn group(world_size: usize) -> Vec<Self> {
        let barrier = Arc::new(Barrier::new(world_size));

        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                barrier: Arc::clone(&barrier),
            })
            .collect()
    }

    /// An agent alone in its group, its barriers never wait.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            barrier: Arc::new(Barrier::new(1)),
        }
    }
}

impl Agent for BarrierAgent {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn barrier(&self) {
        self.barrier.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::task::JoinSet;

    use super::*;

    #[test]
    fn group_assigns_every_rank() {
        let agents = BarrierAgent::group(3);
        let ranks: Vec<_> = agents.iter().map(|a| a.rank()).collect();

        assert_eq!(ranks, [0, 1, 2]);
        assert!(agents.iter().all(|a| a.world_size() == 3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_rank_passes_before_everyone_arrives() {
        const RANKS: usize = 4;

        let arrived = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();

        for agent in BarrierAgent::group(RANKS) {
            let arrived = Arc::clone(&arrived);

            tasks.spawn(async move {
                tokio::time::sleep(Duration::from_millis(5 * agent.rank() as u64)).await;
                arrived.fetch_add(1, Ordering::SeqCst);
                agent.barrier().await;
                arrived.load(Ordering::SeqCst)
            });
        }

        while let Some(seen) = tasks.join_next().await {
            assert_eq!(seen.unwrap(), RANKS);
        }
    }
}
