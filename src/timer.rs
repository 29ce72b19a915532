use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use lazy_static::lazy_static;
use tracing::debug;

use crate::error::TimerError;

// ==========================================
// 1. 单调毫秒时钟
// ==========================================
pub trait Clock {
    fn now_ms(&self) -> u64;
}

pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// 手动拨动的时钟，克隆出来的副本共享同一个指针
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::Relaxed);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

// ==========================================
// 2. 可预约的高精度定时周期
// ==========================================
pub trait TimerResource {
    fn begin_period(&mut self) -> Result<(), TimerError>;
    fn end_period(&mut self) -> Result<(), TimerError>;
}

#[derive(Default)]
struct PeriodState {
    holders: usize,
    saved_slack: Option<libc::c_ulong>,
}

impl PeriodState {
    // 最后一个归还者负责恢复；恢复失败时计数和原值都不动
    fn release(
        &mut self,
        restore: impl FnOnce(libc::c_ulong) -> Result<(), TimerError>,
    ) -> Result<(), TimerError> {
        if self.holders <= 1 {
            if let Some(saved) = self.saved_slack {
                restore(saved)?;
                self.saved_slack = None;
            }
        }
        self.holders = self.holders.saturating_sub(1);
        Ok(())
    }
}

lazy_static! {
    // 进程级引用计数：第一个预约者改 slack，最后一个归还者恢复
    static ref PERIOD_STATE: Mutex<PeriodState> = Mutex::new(PeriodState::default());
}

const HIGH_RES_SLACK_NS: libc::c_ulong = 1;

/// Linux 下用 timer slack 模拟高精度定时周期。
///
/// slack 是线程级属性，begin/end 必须在驱动线程上调用。
#[derive(Default)]
pub struct HighResTimer {
    held: bool,
}

impl HighResTimer {
    pub fn new() -> Self {
        Self { held: false }
    }

    /// 当前进程里还有多少个预约者
    pub fn holders() -> usize {
        PERIOD_STATE.lock().map(|state| state.holders).unwrap_or(0)
    }
}

fn current_slack() -> Result<libc::c_ulong, TimerError> {
    let ret = unsafe { libc::prctl(libc::PR_GET_TIMERSLACK) };
    if ret < 0 {
        return Err(TimerError::Slack(io::Error::last_os_error()));
    }
    Ok(ret as libc::c_ulong)
}

fn set_slack(slack: libc::c_ulong) -> Result<(), TimerError> {
    let ret = unsafe { libc::prctl(libc::PR_SET_TIMERSLACK, slack) };
    if ret < 0 {
        return Err(TimerError::Slack(io::Error::last_os_error()));
    }
    Ok(())
}

impl TimerResource for HighResTimer {
    fn begin_period(&mut self) -> Result<(), TimerError> {
        if self.held {
            return Err(TimerError::AlreadyReserved);
        }
        // 锁中毒也照样用，里面只有两个计数
        let mut state = PERIOD_STATE.lock().unwrap_or_else(|e| e.into_inner());
        if state.holders == 0 {
            let saved = current_slack()?;
            set_slack(HIGH_RES_SLACK_NS)?;
            state.saved_slack = Some(saved);
            debug!("timer slack {}ns -> {}ns", saved, HIGH_RES_SLACK_NS);
        }
        state.holders += 1;
        self.held = true;
        Ok(())
    }

    fn end_period(&mut self) -> Result<(), TimerError> {
        if !self.held {
            return Err(TimerError::NotReserved);
        }
        let mut state = PERIOD_STATE.lock().unwrap_or_else(|e| e.into_inner());
        state.release(|saved| {
            set_slack(saved)?;
            debug!("timer slack restored to {}ns", saved);
            Ok(())
        })?;
        self.held = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let clock = ManualClock::new(10);
        let other = clock.clone();
        clock.advance(5);
        assert_eq!(other.now_ms(), 15);
        other.set(100);
        assert_eq!(clock.now_ms(), 100);
    }

    #[test]
    fn monotonic_clock_never_goes_back() {
        let clock = MonotonicClock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }

    #[test]
    fn high_res_timer_reserve_and_release() {
        let mut timer = HighResTimer::new();
        timer.begin_period().unwrap();
        assert!(matches!(timer.begin_period(), Err(TimerError::AlreadyReserved)));
        assert!(HighResTimer::holders() >= 1);

        timer.end_period().unwrap();
        assert!(matches!(timer.end_period(), Err(TimerError::NotReserved)));
    }

    #[test]
    fn failed_restore_keeps_saved_slack() {
        let mut state = PeriodState {
            holders: 1,
            saved_slack: Some(50_000),
        };

        let result = state.release(|_| Err(TimerError::Slack(io::Error::other("prctl"))));
        assert!(matches!(result, Err(TimerError::Slack(_))));
        assert_eq!(state.holders, 1);
        assert_eq!(state.saved_slack, Some(50_000));

        // 重试时原值还在
        let mut restored = None;
        state
            .release(|saved| {
                restored = Some(saved);
                Ok(())
            })
            .unwrap();
        assert_eq!(restored, Some(50_000));
        assert_eq!(state.holders, 0);
        assert_eq!(state.saved_slack, None);
    }

    #[test]
    fn only_last_holder_restores() {
        let mut state = PeriodState {
            holders: 2,
            saved_slack: Some(50_000),
        };
        state
            .release(|_| panic!("restored while still held"))
            .unwrap();
        assert_eq!(state.holders, 1);
        assert_eq!(state.saved_slack, Some(50_000));
    }
}
