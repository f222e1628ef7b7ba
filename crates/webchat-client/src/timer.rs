use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Single-shot timer resource.
///
/// Arming replaces any previously armed instance; cancellation is
/// idempotent and also happens on drop, which keeps teardown trivially
/// correct.
#[derive(Debug, Default)]
pub struct Timer {
    token: Option<CancellationToken>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer. Must be called from within a tokio runtime.
    pub fn arm<F>(&mut self, delay: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();

        let token = CancellationToken::new();
        let fired = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => on_fire(),
                _ = fired.cancelled() => {}
            }
        });
        self.token = Some(token);
    }

    pub fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}
