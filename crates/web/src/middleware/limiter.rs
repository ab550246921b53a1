//! Request body cap and per-key throttling.
//!
//! Throttling keeps an exponential moving average of the gap between consecutive
//! requests of each key:
//!
//! ```text
//! avg' = K * (now - last_seen) + (1 - K) * avg
//! ```
//!
//! A key seen for the first time starts at `M * min_gap`, and a request is rejected with
//! 429 while the average stays below `min_gap`.
//!
//! Entries live in two generations. Once per rotation period the cold map is cleared and
//! becomes the new hot map while the old hot map turns cold, so a key that stays idle for
//! two periods is forgotten without per-entry timers.

use crate::clock::{Clock, SystemClock};
use crate::context::Context;
use crate::error::{Result, StatusError};
use crate::handler::Handler;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tracing::warn;

const DEFAULT_SMOOTHING: f64 = 0.01;
const DEFAULT_HEADROOM: f64 = 1.2;
const DEFAULT_ROTATION_FLOOR: Duration = Duration::from_secs(10 * 60);

/// Derives the throttling key of a request.
pub type KeyFn = Arc<dyn Fn(&Context) -> String + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Info {
    avg_gap: f64,
    last_seen: SystemTime,
}

struct Generations {
    hot: HashMap<String, Info>,
    cold: HashMap<String, Info>,
    next_rotation: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Pass,
    /// First rejection after the key was within its budget.
    Engaged,
    Throttled,
}

pub struct Limiter {
    max_body: usize,
    min_gap: f64,
    smoothing: f64,
    headroom: f64,
    rotate_every: Duration,
    key_fn: KeyFn,
    clock: Arc<dyn Clock>,
    generations: Mutex<Generations>,
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("max_body", &self.max_body)
            .field("min_gap", &self.min_gap)
            .field("smoothing", &self.smoothing)
            .field("headroom", &self.headroom)
            .field("rotate_every", &self.rotate_every)
            .finish_non_exhaustive()
    }
}

pub struct LimiterBuilder {
    max_body: usize,
    min_gap: Duration,
    smoothing: f64,
    headroom: f64,
    rotation_floor: Duration,
    key_fn: Option<KeyFn>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for LimiterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterBuilder")
            .field("max_body", &self.max_body)
            .field("min_gap", &self.min_gap)
            .field("smoothing", &self.smoothing)
            .field("headroom", &self.headroom)
            .field("rotation_floor", &self.rotation_floor)
            .finish_non_exhaustive()
    }
}

impl Limiter {
    pub fn builder() -> LimiterBuilder {
        LimiterBuilder {
            max_body: 0,
            min_gap: Duration::ZERO,
            smoothing: DEFAULT_SMOOTHING,
            headroom: DEFAULT_HEADROOM,
            rotation_floor: DEFAULT_ROTATION_FLOOR,
            key_fn: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Records a request of `key` at the current time and returns the updated average
    /// gap, plus the average before it if the key was known.
    fn observe(&self, key: &str) -> (f64, Option<f64>) {
        let now = self.clock.now();
        let mut generations = self.generations.lock().unwrap_or_else(PoisonError::into_inner);

        let prior = generations.hot.get(key).or_else(|| generations.cold.get(key)).copied();
        let avg_gap = match prior {
            Some(info) => {
                let elapsed = now.duration_since(info.last_seen).unwrap_or_default().as_secs_f64();
                self.smoothing * elapsed + (1.0 - self.smoothing) * info.avg_gap
            }
            None => self.headroom * self.min_gap,
        };

        if now >= generations.next_rotation {
            let Generations { hot, cold, next_rotation } = &mut *generations;
            cold.clear();
            std::mem::swap(hot, cold);
            *next_rotation = now + self.rotate_every;
        }
        generations.hot.insert(key.to_owned(), Info { avg_gap, last_seen: now });

        (avg_gap, prior.map(|info| info.avg_gap))
    }

    /// Records a request of `key` and decides whether it may pass.
    fn check(&self, key: &str) -> Verdict {
        let (avg_gap, prior) = self.observe(key);
        if avg_gap >= self.min_gap {
            Verdict::Pass
        } else if prior.is_none_or(|prior| prior >= self.min_gap) {
            Verdict::Engaged
        } else {
            Verdict::Throttled
        }
    }

    fn throttling(&self) -> bool {
        self.min_gap > 0.0
    }
}

impl LimiterBuilder {
    /// Caps request bodies at `max` bytes. Zero disables the cap.
    pub fn max_body(mut self, max: usize) -> Self {
        self.max_body = max;
        self
    }

    /// The smallest sustained gap between requests of one key. Zero disables throttling.
    pub fn min_gap(mut self, gap: Duration) -> Self {
        self.min_gap = gap;
        self
    }

    pub fn key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(f));
        self
    }

    /// Weight of the newest sample in the moving average, in `(0, 1)`.
    pub fn smoothing(mut self, k: f64) -> Self {
        self.smoothing = k;
        self
    }

    /// Multiple of the minimum gap a new key starts with.
    pub fn headroom(mut self, m: f64) -> Self {
        self.headroom = m;
        self
    }

    /// Lower bound of the generation rotation period.
    pub fn rotation_floor(mut self, floor: Duration) -> Self {
        self.rotation_floor = floor;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Limiter {
        let min_gap = self.min_gap.as_secs_f64();
        // time for an idle key's average to decay from the seed to min_gap, roughly
        let decay = min_gap * (self.headroom + self.smoothing - 1.0) / self.smoothing;
        let rotate_every = Duration::try_from_secs_f64(decay).unwrap_or_default().max(self.rotation_floor);
        let key_fn: KeyFn = match self.key_fn {
            Some(key_fn) => key_fn,
            None => Arc::new(Context::real_ip),
        };
        let now = self.clock.now();

        Limiter {
            max_body: self.max_body,
            min_gap,
            smoothing: self.smoothing,
            headroom: self.headroom,
            rotate_every,
            key_fn,
            generations: Mutex::new(Generations {
                hot: HashMap::new(),
                cold: HashMap::new(),
                next_rotation: now + rotate_every,
            }),
            clock: self.clock,
        }
    }
}

#[async_trait]
impl Handler for Limiter {
    async fn call(&self, ctx: Context) -> Result<()> {
        if self.max_body > 0 {
            ctx.limit_body(self.max_body).await;
        }

        if self.throttling() {
            let key = (self.key_fn)(&ctx);
            match self.check(&key) {
                Verdict::Pass => {}
                Verdict::Engaged => {
                    warn!(key = %key, "rate limit engaged");
                    return Err(StatusError::too_many_requests(key).into());
                }
                Verdict::Throttled => return Err(StatusError::too_many_requests(key).into()),
            }
        }

        ctx.next().await
    }
}
