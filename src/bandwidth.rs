use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

/// Pool-wide token bucket enforcing `max_speed_bps`. Every worker acquires
/// credits for the bytes it is about to consume; backpressure on the HTTP
/// stream does the rest. A limit <= 0 disables the bucket entirely.
#[derive(Clone)]
pub(crate) struct RateLimiter {
  inner: Arc<LimiterInner>,
}

struct LimiterInner {
  limit_bps: i64,
  credits: AtomicI64,
  notify: Notify,
}

impl RateLimiter {
  pub fn new(limit_bps: i64) -> Self {
    let inner = Arc::new(LimiterInner {
      limit_bps,
      credits: AtomicI64::new(0),
      notify: Notify::new(),
    });
    if limit_bps > 0 {
      spawn_refill_task(Arc::downgrade(&inner));
    }
    Self { inner }
  }

  pub fn is_limited(&self) -> bool {
    self.inner.limit_bps > 0
  }

  /// Consume credits for `bytes`, waiting for refills as needed. Credits are
  /// taken piecewise so a chunk larger than one second of budget still
  /// drains through rather than stalling forever.
  pub async fn acquire(&self, bytes: usize) {
    if self.inner.limit_bps <= 0 {
      return;
    }
    let mut need = bytes as i64;
    while need > 0 {
      let cur = self.inner.credits.load(Ordering::Relaxed);
      if cur > 0 {
        let take = cur.min(need);
        if self
          .inner
          .credits
          .compare_exchange(cur, cur - take, Ordering::Relaxed, Ordering::Relaxed)
          .is_ok()
        {
          need -= take;
        }
        continue;
      }
      self.inner.notify.notified().await;
    }
  }
}

fn spawn_refill_task(inner: Weak<LimiterInner>) {
  // Fine cadence so small reads don't stall too long between refills.
  const TICK: Duration = Duration::from_millis(20);

  tokio::spawn(async move {
    let mut interval = tokio::time::interval(TICK);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last = Instant::now();

    loop {
      interval.tick().await;
      let Some(inner) = inner.upgrade() else {
        return;
      };

      let now = Instant::now();
      let elapsed = now.saturating_duration_since(last);
      last = now;

      let add = (inner.limit_bps as f64 * elapsed.as_secs_f64()) as i64;
      if add <= 0 {
        continue;
      }

      // Cap stored credits at ~1s of budget to bound bursts after idle.
      let max = inner.limit_bps;
      loop {
        let cur = inner.credits.load(Ordering::Relaxed);
        let next = (cur + add).min(max);
        if inner
          .credits
          .compare_exchange(cur, next, Ordering::Relaxed, Ordering::Relaxed)
          .is_ok()
        {
          break;
        }
      }
      inner.notify.notify_waiters();
    }
  });
}

/// 1-second exponentially weighted moving average of throughput, fed from
/// the controller tick.
pub(crate) struct SpeedMeter {
  ema: f64,
  last_total: u64,
  last_at: Instant,
}

impl SpeedMeter {
  pub fn new(initial_total: u64) -> Self {
    Self { ema: 0.0, last_total: initial_total, last_at: Instant::now() }
  }

  pub fn update(&mut self, total: u64) -> i64 {
    let now = Instant::now();
    let dt = now.saturating_duration_since(self.last_at).as_secs_f64();
    if dt <= 0.0 {
      return self.ema as i64;
    }
    let delta = total.saturating_sub(self.last_total) as f64;
    self.last_total = total;
    self.last_at = now;

    let inst = delta / dt;
    let alpha = 1.0 - (-dt).exp();
    self.ema = self.ema * (1.0 - alpha) + inst * alpha;
    self.ema as i64
  }

  pub fn bytes_per_sec(&self) -> i64 {
    self.ema as i64
  }
}

/// Trips once the pool-wide EMA stays under the floor for the configured
/// duration. Disabled when the floor is <= 0.
pub(crate) struct MinSpeedWatchdog {
  floor_bps: i64,
  duration: Duration,
  below_since: Option<Instant>,
}

impl MinSpeedWatchdog {
  pub fn new(floor_bps: i64, duration: Duration) -> Self {
    Self { floor_bps, duration, below_since: None }
  }

  pub fn observe(&mut self, bps: i64) -> bool {
    if self.floor_bps <= 0 {
      return false;
    }
    if bps >= self.floor_bps {
      self.below_since = None;
      return false;
    }
    let since = *self.below_since.get_or_insert_with(Instant::now);
    since.elapsed() >= self.duration
  }

  /// Pause must not count toward the low-speed window.
  pub fn reset(&mut self) {
    self.below_since = None;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn unlimited_acquire_is_immediate() {
    let limiter = RateLimiter::new(-1);
    assert!(!limiter.is_limited());
    limiter.acquire(usize::MAX / 2).await;
  }

  #[tokio::test(start_paused = true)]
  async fn bucket_paces_to_the_configured_rate() {
    let limiter = RateLimiter::new(1000);
    let t0 = Instant::now();
    // 1.5s worth of budget, starting from an empty bucket.
    limiter.acquire(1500).await;
    let elapsed = t0.elapsed();
    assert!(elapsed >= Duration::from_millis(1400), "finished too early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(2500), "finished too late: {elapsed:?}");
  }

  #[tokio::test(start_paused = true)]
  async fn oversized_chunk_drains_through() {
    let limiter = RateLimiter::new(100);
    let t0 = Instant::now();
    // 3x the per-second cap must still complete.
    limiter.acquire(300).await;
    assert!(t0.elapsed() >= Duration::from_millis(2500));
  }

  #[tokio::test(start_paused = true)]
  async fn speed_meter_converges_on_a_steady_rate() {
    let mut meter = SpeedMeter::new(0);
    let mut total = 0u64;
    for _ in 0..50 {
      tokio::time::advance(Duration::from_millis(100)).await;
      total += 100; // 1000 B/s
      meter.update(total);
    }
    let bps = meter.bytes_per_sec();
    assert!((800..=1200).contains(&bps), "ema {bps} not near 1000");
  }

  #[tokio::test(start_paused = true)]
  async fn watchdog_trips_only_after_the_full_window() {
    let mut dog = MinSpeedWatchdog::new(1000, Duration::from_secs(2));
    assert!(!dog.observe(10));
    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(!dog.observe(10));
    // Recovery clears the window.
    assert!(!dog.observe(5000));
    tokio::time::advance(Duration::from_secs(3)).await;
    assert!(!dog.observe(10));
    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(dog.observe(10));

    // Reset (the resume path) starts the window over.
    dog.reset();
    assert!(!dog.observe(10));
    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(dog.observe(10));

    let mut off = MinSpeedWatchdog::new(-1, Duration::from_secs(1));
    assert!(!off.observe(0));
  }
}
