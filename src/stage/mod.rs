use crate::{config::Parameters, error::StageError, packet_list::PacketList};

mod lag_stage;
mod monitor_stage;

pub use lag_stage::{FLUSH_WHEN_FULL, KEEP_AT_MOST, LagStage};
pub use monitor_stage::MonitorStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDescriptor {
    pub display_name: &'static str,
    pub short_name: &'static str, // 持久化参数的命名空间
}

/// 监控面板读的累计计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageStats {
    pub picked: u64,
    pub released: u64,
    pub overflow_flushed: u64,
    pub shutdown_flushed: u64,
    pub backlog: usize,
}

// ==========================================
// 每个 Stage 对宿主暴露的统一生命周期
// ==========================================
pub trait Stage<T> {
    fn descriptor(&self) -> StageDescriptor;
    fn is_enabled(&self) -> bool;
    fn setup(&mut self, params: &Parameters) -> Result<(), StageError>;
    fn start(&mut self) -> Result<(), StageError>;
    /// 返回 true 表示手上还有活，宿主别睡太久
    fn process(&mut self, packets: &mut PacketList<T>) -> bool;
    fn shutdown(&mut self, packets: &mut PacketList<T>) -> Result<(), StageError>;
    fn stats(&self) -> StageStats {
        StageStats::default()
    }
}
