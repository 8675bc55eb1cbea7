/// The view a worker has of its distributed group.
///
/// Ranks only synchronize through `barrier`, in between they progress independently.
#[allow(unused)]
#[trait_variant::make(Agent: Send)]
pub trait LocalAgent {
    /// This worker's 0-based ordinal in the group, rank 0 leads single-writer operations.
    fn rank(&self) -> usize;

    /// The amount of workers in the group.
    fn world_size(&self) -> usize;

    /// Waits until every worker of the group reaches the barrier.
    async fn barrier(&self);
}
