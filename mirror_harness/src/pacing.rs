use std::time::Duration;

/// Fixed politeness delay between cycles. Nothing in the harness retries, so
/// there is no backoff here.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    delay: Duration,
}

impl Pacer {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Whether cycle `index` of `total` should be followed by a pause.
    pub fn should_wait_after(&self, index: u32, total: u32) -> bool {
        !self.delay.is_zero() && index < total
    }

    pub async fn between(&self, index: u32, total: u32) {
        if self.should_wait_after(index, total) {
            tracing::debug!("Waiting {:?} before reflection #{}", self.delay, index + 1);
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_pause_after_last_cycle() {
        let pacer = Pacer::new(Duration::from_secs(3));
        assert!(pacer.should_wait_after(1, 6));
        assert!(pacer.should_wait_after(5, 6));
        assert!(!pacer.should_wait_after(6, 6));
    }

    #[test]
    fn zero_delay_never_pauses() {
        let pacer = Pacer::new(Duration::ZERO);
        assert!(!pacer.should_wait_after(1, 6));
    }

    #[tokio::test(start_paused = true)]
    async fn between_sleeps_for_configured_delay() {
        let pacer = Pacer::new(Duration::from_secs(3));
        let start = tokio::time::Instant::now();
        pacer.between(1, 2).await;
        assert!(start.elapsed() >= Duration::from_secs(3));

        let start = tokio::time::Instant::now();
        pacer.between(2, 2).await;
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
