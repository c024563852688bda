//! Construction of the per-peer session resource.

/// Creates a peer's local session resource.
///
/// Called at most once per peer at any instant; the barrier holds its state
/// lock for the duration of the call.
pub trait ResourceFactory<R>: Send + Sync {
    fn create(&self) -> R;
}

impl<R, F> ResourceFactory<R> for F
where
    F: Fn() -> R + Send + Sync,
{
    fn create(&self) -> R {
        self()
    }
}
