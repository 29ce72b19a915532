//! 延迟 / 抖动 Stage
//!
//! 每个 tick 把符合方向的包从共享链表里摘进私有 FIFO，盖上放行时刻，
//! 到点后按进入顺序塞回链表头部。缓冲区满了就强制冲掉一批，保内存不保时序。

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::config::{LagConfig, LagSettings, Parameters};
use crate::error::StageError;
use crate::packet::Packet;
use crate::packet_list::{NodeId, PacketList};
use crate::stage::{Stage, StageDescriptor, StageStats};
use crate::timer::{Clock, TimerResource};

pub const KEEP_AT_MOST: usize = 5000;
// 缓冲区满时一次冲掉这么多
pub const FLUSH_WHEN_FULL: usize = 800;

const DESCRIPTOR: StageDescriptor = StageDescriptor {
    display_name: "Lag",
    short_name: "lag",
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LagState {
    Idle,
    Active,
}

pub struct LagStage<T, C: Clock, R: TimerResource> {
    config: LagConfig,
    buffer: VecDeque<Packet<T>>, // 队头最老
    capacity: usize,
    flush_batch: usize,

    clock: C,
    timer: R,
    period_held: bool,
    rng: StdRng,

    state: LagState,
    stats: StageStats,
}

impl<T, C: Clock, R: TimerResource> LagStage<T, C, R> {
    pub fn new(config: LagConfig, clock: C, timer: R) -> Self {
        Self::with_limits(config, clock, timer, KEEP_AT_MOST, FLUSH_WHEN_FULL)
    }

    pub fn with_limits(
        config: LagConfig,
        clock: C,
        timer: R,
        capacity: usize,
        flush_batch: usize,
    ) -> Self {
        assert!(
            flush_batch >= 1 && flush_batch <= capacity,
            "flush batch {flush_batch} must be within 1..={capacity}"
        );
        Self {
            config,
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            flush_batch,
            clock,
            timer,
            period_held: false,
            rng: StdRng::from_entropy(),
            state: LagState::Idle,
            stats: StageStats::default(),
        }
    }

    /// 固定随机种子，抖动可复现
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn config(&self) -> &LagConfig {
        &self.config
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_active(&self) -> bool {
        self.state == LagState::Active
    }

    /// 缓冲区里包的 id，从老到新
    pub fn buffered_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.buffer.iter().map(|p| p.id)
    }

    /// 缓冲区里每个包的 (id, 放行时刻)，从老到新
    pub fn buffered_deadlines(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.buffer.iter().map(|p| (p.id, p.release_at))
    }

    fn release_time(&mut self, settings: &LagSettings, now: u64) -> u64 {
        let delay = settings.delay_ms as u64;
        if settings.jitter_ms == 0 {
            now + delay
        } else {
            // 抖动分支重新取一次时钟
            let jitter = self.rng.gen_range(0..settings.jitter_ms) as u64;
            self.clock.now_ms() + delay + jitter
        }
    }

    // 1. 从链表尾往头扫，符合方向的摘进缓冲区
    fn pick_up(&mut self, packets: &mut PacketList<T>, settings: &LagSettings, now: u64) {
        let mut cursor = packets.tail();
        while self.buffer.len() < self.capacity {
            let Some(id) = cursor else { break };
            cursor = packets.prev(id);

            let eligible = packets
                .get(id)
                .is_some_and(|p| settings.captures(p.direction()));
            if !eligible {
                continue;
            }
            if let Some(mut packet) = packets.detach(id) {
                packet.release_at = self.release_time(settings, now);
                self.buffer.push_back(packet);
                self.stats.picked += 1;
            }
        }
        debug_assert!(self.buffer.len() <= self.capacity);
    }

    // 2. 队头到点才放，队头没到点后面的再早也得等
    fn release_due(&mut self, packets: &mut PacketList<T>, now: u64) -> Option<NodeId> {
        let mut anchor = None;
        let mut released = 0u64;
        while self.buffer.front().is_some_and(|p| p.release_at <= now) {
            let Some(packet) = self.buffer.pop_front() else { break };
            anchor = Some(reinsert_at_head(packets, anchor, packet));
            released += 1;
        }
        if released > 0 {
            self.stats.released += released;
            debug!("released {} lagged packets, {} still buffered", released, self.buffer.len());
        }
        anchor
    }

    // 3. 满了就不管时间，直接从队头冲一批出去
    fn flush_overflow(&mut self, packets: &mut PacketList<T>, mut anchor: Option<NodeId>) {
        // 在放行之后判断：抓满了但本轮放行让出了位置，就不冲
        if self.buffer.len() < self.capacity {
            return;
        }
        let mut flushed = 0u64;
        for _ in 0..self.flush_batch {
            let Some(packet) = self.buffer.pop_front() else { break };
            anchor = Some(reinsert_at_head(packets, anchor, packet));
            flushed += 1;
        }
        self.stats.overflow_flushed += flushed;
        warn!(
            "lag buffer full ({} packets), force flushed {}",
            self.capacity, flushed
        );
    }
}

// 本 tick 放出来的包挨个接在上一个后面，保持出队顺序
fn reinsert_at_head<T>(
    packets: &mut PacketList<T>,
    anchor: Option<NodeId>,
    packet: Packet<T>,
) -> NodeId {
    match anchor {
        Some(anchor) => match packets.insert_after(anchor, packet) {
            Ok(id) => id,
            Err(packet) => packets.push_front(packet),
        },
        None => packets.push_front(packet),
    }
}

impl<T, C: Clock, R: TimerResource> Stage<T> for LagStage<T, C, R> {
    fn descriptor(&self) -> StageDescriptor {
        DESCRIPTOR
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled()
    }

    fn setup(&mut self, params: &Parameters) -> Result<(), StageError> {
        self.config
            .apply_parameters(DESCRIPTOR.short_name, params)
            .map_err(|source| StageError::Config {
                stage: DESCRIPTOR.short_name,
                source,
            })
    }

    fn start(&mut self) -> Result<(), StageError> {
        assert!(
            self.state == LagState::Idle,
            "lag stage started while already active"
        );
        // 重新激活绝不能继承上一轮的残包
        assert!(
            self.buffer.is_empty(),
            "lag stage started with {} leftover packets",
            self.buffer.len()
        );

        self.timer.begin_period().map_err(|source| StageError::Start {
            stage: DESCRIPTOR.short_name,
            source,
        })?;
        self.period_held = true;
        self.state = LagState::Active;

        let snap = self.config.snapshot();
        info!(
            "lag started: delay={}ms jitter={}ms inbound={} outbound={}",
            snap.delay_ms, snap.jitter_ms, snap.inbound, snap.outbound
        );
        Ok(())
    }

    fn process(&mut self, packets: &mut PacketList<T>) -> bool {
        assert!(
            self.state == LagState::Active,
            "lag stage ticked while idle"
        );

        let settings = self.config.snapshot();
        let now = self.clock.now_ms();

        self.pick_up(packets, &settings, now);
        let anchor = self.release_due(packets, now);
        self.flush_overflow(packets, anchor);

        self.stats.backlog = self.buffer.len();
        !self.buffer.is_empty()
    }

    fn shutdown(&mut self, packets: &mut PacketList<T>) -> Result<(), StageError> {
        info!("closing down lag, flushing {} packets", self.buffer.len());

        // 不管到没到点，从老到新全部塞回链表尾部
        while let Some(packet) = self.buffer.pop_front() {
            packets.push_back(packet);
            self.stats.shutdown_flushed += 1;
        }
        self.stats.backlog = 0;
        self.state = LagState::Idle;

        if self.period_held {
            self.period_held = false;
            self.timer.end_period().map_err(|source| StageError::Shutdown {
                stage: DESCRIPTOR.short_name,
                source,
            })?;
        }
        Ok(())
    }

    fn stats(&self) -> StageStats {
        self.stats
    }
}

impl<T, C: Clock, R: TimerResource> Drop for LagStage<T, C, R> {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            warn!(
                "lag stage dropped without shutdown, {} packets lost",
                self.buffer.len()
            );
        }
        if self.period_held {
            self.period_held = false;
            if let Err(e) = self.timer.end_period() {
                warn!("failed to release timer period on drop: {}", e);
            }
        }
    }
}
