use crate::*;

/// Spawn a task, logging how it ended.
pub fn err_spawn<F, E>(hint: &'static str, f: F)
where
    F: std::future::Future<Output = Result<(), E>> + 'static + Send,
    E: std::fmt::Debug + 'static + Send,
{
    tokio::task::spawn(async move {
        match f.await {
            Ok(_) => debug!(task = hint, "task ended ok"),
            Err(e) => warn!(task = hint, err = ?e, "task ended with error"),
        }
    });
}
