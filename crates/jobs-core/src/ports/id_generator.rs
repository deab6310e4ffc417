//! IdGenerator port - JobId の採番
//!
//! push 時に振る JobId は Clock の時刻から作る ULID です。
//! 同じミリ秒内でも単調増加するので、ID の順序 = push の順序になります。

use std::sync::Mutex;
use std::time::SystemTime;

use ulid::{Generator, Ulid};

use crate::domain::ids::JobId;
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_job_id(&self) -> JobId;
}

/// Monotonic ULIDs stamped with the clock's time.
pub struct UlidGenerator<C> {
    clock: C,
    state: Mutex<Generator>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            state: Mutex::new(Generator::new()),
        }
    }

    fn next_ulid(&self) -> Ulid {
        let now = self.clock.now();
        let monotonic = match self.state.lock() {
            Ok(mut generator) => generator.generate_from_datetime(SystemTime::from(now)).ok(),
            Err(_) => None,
        };
        // random part overflowed within one millisecond (or a poisoned lock)
        monotonic.unwrap_or_else(|| {
            Ulid::from_parts(now.timestamp_millis().max(0) as u64, rand::random())
        })
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_job_id(&self) -> JobId {
        JobId::from(self.next_ulid())
    }
}
