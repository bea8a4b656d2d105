use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::debug;

type Release = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Release actions accumulated while building something, run newest first.
///
/// Each action runs at most once: [`Destructors::release`] drains the list,
/// so a second call finds nothing left to do. Actions are infallible; they
/// log their own failures.
#[derive(Default)]
pub(crate) struct Destructors {
    actions: Mutex<Vec<(String, Release)>>,
}

impl Destructors {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn push<F>(&self, name: impl Into<String>, release: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.actions
            .lock()
            .await
            .push((name.into(), Box::new(release)));
    }

    pub(crate) async fn release(&self) {
        let actions = std::mem::take(&mut *self.actions.lock().await);
        for (name, release) in actions.into_iter().rev() {
            debug!(resource = %name, "releasing");
            release().await;
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.actions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::FutureExt;

    use super::*;

    #[tokio::test]
    async fn releases_in_reverse_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let d = Destructors::new();
        for name in ["netns", "lan", "kv"] {
            let log = Arc::clone(&log);
            d.push(name, move || async move { log.lock().push(name) }.boxed())
                .await;
        }
        d.release().await;
        assert_eq!(*log.lock(), ["kv", "lan", "netns"]);
    }

    #[tokio::test]
    async fn second_release_is_a_no_op() {
        let count = Arc::new(parking_lot::Mutex::new(0));
        let d = Destructors::new();
        let c = Arc::clone(&count);
        d.push("x", move || async move { *c.lock() += 1 }.boxed())
            .await;
        assert_eq!(d.len().await, 1);
        d.release().await;
        d.release().await;
        assert_eq!(*count.lock(), 1);
        assert_eq!(d.len().await, 0);
    }
}
