// ==========================================
// 在途数据包 (被各个 Stage 搬来搬去的面单)
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn is_inbound(self) -> bool {
        self == Direction::Inbound
    }

    pub fn is_outbound(self) -> bool {
        self == Direction::Outbound
    }
}

#[derive(Debug)]
pub struct Packet<T> {
    // 1. 核心载体
    pub msg: T,
    pub id: u64,

    // 2. 出入方向，抓包时定死，之后不许改
    direction: Direction,

    // 3. 路由归还依据 (为 Verdict 准备)
    pub queue_num: usize,
    pub pkt_len: usize,

    // ✅ 计划放行时刻 (单调毫秒)，只在延迟类 Stage 的缓冲区里有效
    pub release_at: u64,
}

impl<T> Packet<T> {
    pub fn new(id: u64, msg: T, direction: Direction, queue_num: usize, pkt_len: usize) -> Self {
        Self {
            msg,
            id,
            direction,
            queue_num,
            pkt_len,
            release_at: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_inbound(&self) -> bool {
        self.direction.is_inbound()
    }

    pub fn is_outbound(&self) -> bool {
        self.direction.is_outbound()
    }
}
