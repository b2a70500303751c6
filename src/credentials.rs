use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Requests a credential may serve per window before it stops being preferred.
    pub max_per_credential: u32,
    /// Minimum gap between two uses of the same credential.
    pub cooldown: Duration,
    /// Request counters reset when a window elapses.
    pub window: Duration,
    /// How long a rate-limited credential is pushed out of rotation.
    pub penalty: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_credential: 60,
            cooldown: Duration::from_secs(1),
            window: Duration::from_secs(60),
            penalty: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct KeyUsageRecord {
    pub request_count: u32,
    pub last_used: Option<Instant>,
    pub penalty_until: Option<Instant>,
}

impl KeyUsageRecord {
    fn admits(&self, now: Instant, cfg: &PoolConfig) -> bool {
        if self.penalty_until.is_some_and(|until| now < until) {
            return false;
        }
        if self.request_count >= cfg.max_per_credential {
            return false;
        }
        match self.last_used {
            None => true,
            Some(at) => now.saturating_duration_since(at) > cfg.cooldown,
        }
    }
}

/// A credential handed out for one request.
#[derive(Clone, Debug)]
pub struct Lease {
    pub index: usize,
    pub key: String,
}

/// Round-robin credential selection with rate accounting. Not synchronised on
/// its own: owners keep it behind a single lock so that selecting a credential
/// and marking it used happen as one step.
#[derive(Debug)]
pub struct CredentialPool {
    keys: Vec<String>,
    usage: Vec<KeyUsageRecord>,
    cursor: Option<usize>,
    window_started: Option<Instant>,
    cfg: PoolConfig,
}

impl CredentialPool {
    pub fn new(keys: Vec<String>, cfg: PoolConfig) -> Self {
        let usage = vec![KeyUsageRecord::default(); keys.len()];
        Self { keys, usage, cursor: None, window_started: None, cfg }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn usage(&self) -> &[KeyUsageRecord] {
        &self.usage
    }

    /// Picks the next admissible credential after the last one used, or the
    /// least recently used one when none is admissible, and marks it used.
    pub fn acquire(&mut self, now: Instant) -> Option<Lease> {
        if self.keys.is_empty() {
            return None;
        }
        self.roll_window(now);

        let n = self.keys.len();
        let start = self.cursor.map(|c| (c + 1) % n).unwrap_or(0);
        let admissible = (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&i| self.usage[i].admits(now, &self.cfg));

        let index = match admissible {
            Some(i) => i,
            None => {
                let i = self.least_recently_used(start);
                debug!(credential = i, "no admissible credential, using least recently used");
                i
            }
        };

        let record = &mut self.usage[index];
        record.request_count += 1;
        // a penalised credential keeps its future timestamp
        if record.last_used.map_or(true, |at| at < now) {
            record.last_used = Some(now);
        }
        self.cursor = Some(index);
        Some(Lease { index, key: self.keys[index].clone() })
    }

    /// Pushes a rate-limited credential out of rotation by stamping its
    /// last use into the future.
    pub fn penalize(&mut self, index: usize, now: Instant) {
        let until = now + self.cfg.penalty;
        if let Some(record) = self.usage.get_mut(index) {
            record.penalty_until = Some(until);
            record.last_used = Some(until);
            warn!(credential = index, penalty_ms = self.cfg.penalty.as_millis() as u64, "credential rate limited");
        }
    }

    fn roll_window(&mut self, now: Instant) {
        match self.window_started {
            Some(started) if now.saturating_duration_since(started) < self.cfg.window => {}
            _ => {
                self.window_started = Some(now);
                for record in &mut self.usage {
                    record.request_count = 0;
                }
            }
        }
    }

    fn least_recently_used(&self, start: usize) -> usize {
        let n = self.keys.len();
        (0..n)
            .map(|offset| (start + offset) % n)
            .min_by_key(|&i| self.usage[i].last_used)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("key-{i}")).collect()
    }

    fn no_cooldown() -> PoolConfig {
        PoolConfig { cooldown: Duration::ZERO, ..Default::default() }
    }

    #[test]
    fn rotates_round_robin() {
        let mut pool = CredentialPool::new(keys(3), no_cooldown());
        let t0 = Instant::now();
        let picked: Vec<usize> = (1..=6)
            .map(|i| pool.acquire(t0 + Duration::from_millis(i * 10)).unwrap().index)
            .collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(pool.usage()[0].request_count, 2);
    }

    #[test]
    fn ten_calls_over_three_credentials_stay_fair() {
        let mut pool = CredentialPool::new(keys(3), no_cooldown());
        let t0 = Instant::now();
        let mut longest_run = 0;
        let mut run = 0;
        let mut prev = None;
        for i in 1..=10u64 {
            let idx = pool.acquire(t0 + Duration::from_millis(i)).unwrap().index;
            run = if prev == Some(idx) { run + 1 } else { 1 };
            longest_run = longest_run.max(run);
            prev = Some(idx);
        }
        // ceil(10 / 3) + 1
        assert!(longest_run <= 5);
        assert_eq!(longest_run, 1);
    }

    #[test]
    fn cooldown_skips_recently_used_credential() {
        let cfg = PoolConfig { cooldown: Duration::from_secs(1), ..Default::default() };
        let mut pool = CredentialPool::new(keys(2), cfg);
        let t0 = Instant::now();
        assert_eq!(pool.acquire(t0).unwrap().index, 0);
        assert_eq!(pool.acquire(t0 + Duration::from_millis(10)).unwrap().index, 1);
        // both cooling down: least recently used wins
        assert_eq!(pool.acquire(t0 + Duration::from_millis(20)).unwrap().index, 0);
        // past the cooldown of credential 1 only
        assert_eq!(pool.acquire(t0 + Duration::from_millis(1015)).unwrap().index, 1);
    }

    #[test]
    fn exhausted_credentials_fall_back_to_lru() {
        let cfg = PoolConfig { max_per_credential: 1, ..no_cooldown() };
        let mut pool = CredentialPool::new(keys(2), cfg);
        let t0 = Instant::now();
        assert_eq!(pool.acquire(t0).unwrap().index, 0);
        assert_eq!(pool.acquire(t0 + Duration::from_millis(1)).unwrap().index, 1);
        assert_eq!(pool.acquire(t0 + Duration::from_millis(2)).unwrap().index, 0);
        assert_eq!(pool.usage()[0].request_count, 2);
    }

    #[test]
    fn window_rollover_resets_counts() {
        let cfg = PoolConfig {
            max_per_credential: 1,
            window: Duration::from_secs(10),
            ..no_cooldown()
        };
        let mut pool = CredentialPool::new(keys(1), cfg);
        let t0 = Instant::now();
        pool.acquire(t0).unwrap();
        assert_eq!(pool.usage()[0].request_count, 1);
        pool.acquire(t0 + Duration::from_secs(11)).unwrap();
        assert_eq!(pool.usage()[0].request_count, 1);
    }

    #[test]
    fn penalized_credential_is_skipped_until_penalty_expires() {
        let cfg = PoolConfig { penalty: Duration::from_secs(30), ..no_cooldown() };
        let mut pool = CredentialPool::new(keys(2), cfg);
        let t0 = Instant::now();
        assert_eq!(pool.acquire(t0).unwrap().index, 0);
        pool.penalize(0, t0);
        for i in 1..5u64 {
            assert_eq!(pool.acquire(t0 + Duration::from_millis(i)).unwrap().index, 1);
        }
        assert_eq!(pool.acquire(t0 + Duration::from_secs(31)).unwrap().index, 0);
    }

    #[test]
    fn lru_fallback_prefers_unpenalized() {
        let cfg = PoolConfig { cooldown: Duration::from_secs(5), ..Default::default() };
        let mut pool = CredentialPool::new(keys(2), cfg);
        let t0 = Instant::now();
        pool.acquire(t0).unwrap();
        pool.penalize(0, t0);
        pool.acquire(t0 + Duration::from_millis(1)).unwrap();
        // 1 is cooling down, 0 is penalised far into the future
        assert_eq!(pool.acquire(t0 + Duration::from_millis(2)).unwrap().index, 1);
    }

    #[test]
    fn empty_pool_yields_nothing() {
        let mut pool = CredentialPool::new(Vec::new(), PoolConfig::default());
        assert!(pool.acquire(Instant::now()).is_none());
    }

    #[tokio::test]
    async fn concurrent_acquires_never_share_a_single_use_credential() {
        let cfg = PoolConfig { max_per_credential: 1, ..no_cooldown() };
        let pool = Arc::new(Mutex::new(CredentialPool::new(keys(4), cfg)));
        let now = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.lock().await.acquire(now).unwrap().index }));
        }
        let mut seen = Vec::new();
        for h in handles {
            seen.push(h.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
