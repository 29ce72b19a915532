use chrono::Local;
use std::time::{Duration, Instant};

use crate::config::Parameters;
use crate::error::StageError;
use crate::packet_list::PacketList;
use crate::stage::{Stage, StageDescriptor, StageStats};

// ==========================================
// 监控套管：套在任何 Stage 外面，每秒打一张报表
// ==========================================
pub struct MonitorStage<T> {
    pub inner: Box<dyn Stage<T>>,
    last_stats: StageStats, // 上一次报表时的累计值，用来算每秒增量
    last_report: Instant,
    interval: Duration,
}

impl<T> MonitorStage<T> {
    pub fn new(inner: Box<dyn Stage<T>>) -> Self {
        Self::with_interval(inner, Duration::from_secs(1))
    }

    pub fn with_interval(inner: Box<dyn Stage<T>>, interval: Duration) -> Self {
        Self {
            inner,
            last_stats: StageStats::default(),
            last_report: Instant::now(),
            interval,
        }
    }

    /// 算出本周期的增量并推进基线
    fn take_delta(&mut self) -> StageStats {
        let now = self.inner.stats();
        let delta = StageStats {
            picked: now.picked.saturating_sub(self.last_stats.picked),
            released: now.released.saturating_sub(self.last_stats.released),
            overflow_flushed: now
                .overflow_flushed
                .saturating_sub(self.last_stats.overflow_flushed),
            shutdown_flushed: now
                .shutdown_flushed
                .saturating_sub(self.last_stats.shutdown_flushed),
            backlog: now.backlog, // 积压水位是实时库存，不算增量
        };
        self.last_stats = now;
        delta
    }

    fn check_and_report(&mut self, queued: usize, force: bool) {
        let elapsed = self.last_report.elapsed();
        if elapsed < self.interval && !force {
            return;
        }

        let delta = self.take_delta();
        let secs = elapsed.as_secs_f64().max(0.001);
        let now_str = Local::now().format("%H:%M:%S").to_string();
        let name = self.inner.descriptor().display_name;

        println!("\n📊 [{}] 监控面板: {}", now_str, name);
        println!("--------------------------------------------------------------------------");
        println!(
            "{:<10} | {:<10} | {:<10} | {:<10} | {:<10} | {:<10}",
            "入缓冲(包/s)", "放行(包/s)", "溢出冲刷", "关停冲刷", "实时积压", "链表待发"
        );
        println!("--------------------------------------------------------------------------");
        println!(
            "{:<10.1} | {:<10.1} | {:<10} | {:<10} | {:<10} | {:<10}",
            delta.picked as f64 / secs,
            delta.released as f64 / secs,
            delta.overflow_flushed,
            delta.shutdown_flushed,
            delta.backlog,
            queued
        );
        println!("==========================================================================\n");

        self.last_report = Instant::now();
    }
}

impl<T> Stage<T> for MonitorStage<T> {
    fn descriptor(&self) -> StageDescriptor {
        self.inner.descriptor()
    }

    fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    fn setup(&mut self, params: &Parameters) -> Result<(), StageError> {
        self.inner.setup(params)
    }

    fn start(&mut self) -> Result<(), StageError> {
        // 新一轮激活，基线对齐当前累计值
        self.last_stats = self.inner.stats();
        self.last_report = Instant::now();
        self.inner.start()
    }

    fn process(&mut self, packets: &mut PacketList<T>) -> bool {
        let pending = self.inner.process(packets);
        self.check_and_report(packets.len(), false);
        pending
    }

    fn shutdown(&mut self, packets: &mut PacketList<T>) -> Result<(), StageError> {
        let result = self.inner.shutdown(packets);
        // 关停时强制出最后一张报表
        self.check_and_report(packets.len(), true);
        result
    }

    fn stats(&self) -> StageStats {
        self.inner.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LagConfig;
    use crate::packet::{Direction, Packet};
    use crate::stage::LagStage;
    use crate::timer::{ManualClock, TimerResource};

    struct NoopTimer;

    impl TimerResource for NoopTimer {
        fn begin_period(&mut self) -> Result<(), crate::error::TimerError> {
            Ok(())
        }
        fn end_period(&mut self) -> Result<(), crate::error::TimerError> {
            Ok(())
        }
    }

    #[test]
    fn delegates_lifecycle_and_tracks_deltas() {
        let config = LagConfig::new();
        config.set_enabled(true);
        let clock = ManualClock::new(0);
        let lag: LagStage<(), _, _> = LagStage::new(config, clock.clone(), NoopTimer);
        let mut monitor: MonitorStage<()> =
            MonitorStage::with_interval(Box::new(lag), Duration::from_secs(3600));

        assert!(monitor.is_enabled());
        assert_eq!(monitor.descriptor().short_name, "lag");

        let mut list = PacketList::new();
        for id in 0..3 {
            list.push_back(Packet::new(id, (), Direction::Inbound, 0, 60));
        }
        monitor.start().unwrap();
        assert!(monitor.process(&mut list));
        assert_eq!(monitor.stats().picked, 3);

        let delta = monitor.take_delta();
        assert_eq!(delta.picked, 3);
        assert_eq!(delta.backlog, 3);

        clock.set(50);
        assert!(!monitor.process(&mut list));
        let delta = monitor.take_delta();
        assert_eq!(delta.picked, 0);
        assert_eq!(delta.released, 3);
        assert_eq!(delta.backlog, 0);

        monitor.shutdown(&mut list).unwrap();
        assert_eq!(list.len(), 3);
    }
}
