// Panic isolation for batch tasks
use std::any::Any;
use std::future::Future;
use tokio::task::JoinError;
use tracing::error;

/// Result of a panic-guarded execution
#[derive(Debug)]
pub enum PanicGuardResult<T> {
    /// Execution completed
    Success(T),
    /// Execution panicked
    Panicked(String),
    /// Task was aborted before finishing
    Cancelled,
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

fn from_join_error<T>(err: JoinError) -> PanicGuardResult<T> {
    if err.is_panic() {
        let msg = panic_message(&*err.into_panic());
        error!(panic_msg = %msg, "Batch task panicked");
        PanicGuardResult::Panicked(msg)
    } else {
        PanicGuardResult::Cancelled
    }
}

/// Run a future on its own task so a panic inside it cannot unwind the caller
pub async fn execute_guarded_async<F, T>(future: F) -> PanicGuardResult<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(future).await {
        Ok(value) => PanicGuardResult::Success(value),
        Err(e) => from_join_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_passes_value_through() {
        match execute_guarded_async(async { 42 }).await {
            PanicGuardResult::Success(v) => assert_eq!(v, 42),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let result = execute_guarded_async(async {
            if true {
                panic!("calculator exploded");
            }
        })
        .await;
        match result {
            PanicGuardResult::Panicked(msg) => assert_eq!(msg, "calculator exploded"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_panic_message_formats() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*owned), "owned");
        let opaque: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*opaque), "Unknown panic");
    }
}
