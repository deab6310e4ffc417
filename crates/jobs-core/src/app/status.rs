//! Status - consumer group のカウンタ
//!
//! consumer の各スロットが同時に更新するので Atomic で持ち、
//! stat 呼び出し時に `ConsumerStat` のスナップショットに変換します。

use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::ConsumerStat;

#[derive(Debug, Default)]
pub struct ConsumerCounters {
    delivered: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    discarded: AtomicU64,
    handler_errors: AtomicU64,
    reconnects: AtomicU64,
    expired_handles: AtomicU64,
}

/// Which counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Delivered,
    Acked,
    Retried,
    DeadLettered,
    Discarded,
    HandlerError,
    Reconnect,
    ExpiredHandle,
}

impl ConsumerCounters {
    pub fn incr(&self, counter: Counter) {
        let cell = match counter {
            Counter::Delivered => &self.delivered,
            Counter::Acked => &self.acked,
            Counter::Retried => &self.retried,
            Counter::DeadLettered => &self.dead_lettered,
            Counter::Discarded => &self.discarded,
            Counter::HandlerError => &self.handler_errors,
            Counter::Reconnect => &self.reconnects,
            Counter::ExpiredHandle => &self.expired_handles,
        };
        cell.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerStat {
        ConsumerStat {
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            expired_handles: self.expired_handles.load(Ordering::Relaxed),
        }
    }
}
