use async_trait::async_trait;

/// Store-wide source of execution identifiers.
///
/// Implementations must increment and read the counter in one atomic store
/// operation, creating it on first use, so concurrent callers in different
/// processes never receive the same value.
#[async_trait]
pub trait SequenceGenerator: Send + Sync {
    /// Next identifier. The first call against a fresh store returns 1.
    async fn next(&self) -> crate::Result<i64>;
}
