use std::future::Future;
use std::time::Duration;

use homecare_common::{HomecareError, Result};

/// Run `fut` with a deadline. An elapsed deadline becomes the error built by
/// `on_elapsed`, so each collaborator reports timeouts in its own variant.
pub(crate) async fn within<T, F>(
    limit: Duration,
    fut: F,
    on_elapsed: fn(String) -> HomecareError,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_elapsed(format!(
            "timed out after {} ms",
            limit.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_elapsed_maps_to_variant() {
        let result: Result<()> = within(
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            HomecareError::VectorIndex,
        )
        .await;
        assert!(matches!(result, Err(HomecareError::VectorIndex(msg)) if msg.contains("10 ms")));
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let result: Result<()> = within(
            Duration::from_secs(1),
            async { Err(HomecareError::Storage("down".into())) },
            HomecareError::VectorIndex,
        )
        .await;
        assert!(matches!(result, Err(HomecareError::Storage(_))));
    }
}
