use std::collections::HashMap;
use std::time::Duration;

const WINDOW: usize = 10;
const MIN_SAMPLES: usize = 5;
const DEVIATION_MULTIPLIER: f32 = 3.0;

pub const DEFAULT_MAX_REPLY_WAIT: Duration = Duration::from_secs(3);

/// Rolling window of recent reply times for one query type.
#[derive(Debug, Default, Clone)]
struct Ring {
    samples: [f32; WINDOW],
    len: usize,
    next: usize,
}

impl Ring {
    fn push(&mut self, secs: f32) {
        self.samples[self.next] = secs;
        self.next = (self.next + 1) % WINDOW;
        self.len = (self.len + 1).min(WINDOW);
    }

    fn mean_plus_deviation(&self, multiplier: f32) -> Option<f32> {
        if self.len < MIN_SAMPLES {
            return None;
        }

        let samples = &self.samples[..self.len];
        let mean = samples.iter().sum::<f32>() / self.len as f32;
        let variance =
            samples.iter().map(|s| (s - mean) * (s - mean)).sum::<f32>() / self.len as f32;

        Some(mean + multiplier * variance.sqrt())
    }

    fn max_reply_wait(&self) -> Duration {
        match self.mean_plus_deviation(DEVIATION_MULTIPLIER) {
            // mean + 3 sigma covers ~99.9% of replies.
            Some(secs) => Duration::from_secs_f32(secs).min(DEFAULT_MAX_REPLY_WAIT),
            None => DEFAULT_MAX_REPLY_WAIT,
        }
    }
}

/// Per-query-type reply statistics driving adaptive timeouts.
#[derive(Debug, Default)]
pub struct Stats {
    per_type: HashMap<&'static str, Ring>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reply_time(&mut self, query_type: &'static str, elapsed: Duration) {
        self.per_type
            .entry(query_type)
            .or_default()
            .push(elapsed.as_secs_f32());
    }

    pub fn max_reply_wait_time(&self, query_type: &str) -> Duration {
        match self.per_type.get(query_type) {
            Some(ring) => ring.max_reply_wait(),
            None => DEFAULT_MAX_REPLY_WAIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_until_enough_samples() {
        let mut stats = Stats::new();

        for _ in 0..MIN_SAMPLES - 1 {
            stats.add_reply_time("find_node", Duration::from_millis(20));
        }

        assert_eq!(
            stats.max_reply_wait_time("find_node"),
            DEFAULT_MAX_REPLY_WAIT
        );
        assert_eq!(stats.max_reply_wait_time("ping"), DEFAULT_MAX_REPLY_WAIT);
    }

    #[test]
    fn fast_replies_tighten_the_timeout() {
        let mut stats = Stats::new();

        // Ten replies between 20 and 40 ms.
        for i in 0..10 {
            let ms = if i % 2 == 0 { 20 } else { 40 };
            stats.add_reply_time("find_node", Duration::from_millis(ms));
        }

        let timeout = stats.max_reply_wait_time("find_node");
        assert!(timeout >= Duration::from_millis(40), "{timeout:?}");
        assert!(timeout <= Duration::from_millis(100), "{timeout:?}");
    }

    #[test]
    fn clamped_to_default() {
        let mut stats = Stats::new();

        for _ in 0..10 {
            stats.add_reply_time("get", Duration::from_secs(30));
        }

        assert_eq!(stats.max_reply_wait_time("get"), DEFAULT_MAX_REPLY_WAIT);
    }

    #[test]
    fn window_forgets_old_samples() {
        let mut stats = Stats::new();

        for _ in 0..10 {
            stats.add_reply_time("ping", Duration::from_secs(2));
        }
        for _ in 0..10 {
            stats.add_reply_time("ping", Duration::from_millis(10));
        }

        assert!(stats.max_reply_wait_time("ping") < Duration::from_millis(100));
    }
}
