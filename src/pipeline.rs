use tracing::{error, info};

use crate::config::Parameters;
use crate::error::StageError;
use crate::packet_list::PacketList;
use crate::stage::Stage;

// ==========================================
// 宿主：按配置开关驱动各 Stage 的激活/停用，再挨个 tick
// ==========================================
struct StageSlot<T> {
    stage: Box<dyn Stage<T>>,
    active: bool, // 激活状态归宿主管，和配置里的 enabled 分开
    ticks: u64,
}

pub struct Pipeline<T> {
    slots: Vec<StageSlot<T>>,
}

impl<T> Default for Pipeline<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Pipeline<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn add(&mut self, stage: Box<dyn Stage<T>>) {
        self.slots.push(StageSlot {
            stage,
            active: false,
            ticks: 0,
        });
    }

    pub fn setup(&mut self, params: &Parameters) -> Result<(), StageError> {
        for slot in &mut self.slots {
            slot.stage.setup(params)?;
        }
        Ok(())
    }

    pub fn is_active(&self, short_name: &str) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.active && slot.stage.descriptor().short_name == short_name)
    }

    /// 按顺序跑一轮。返回 true 表示还有 Stage 攥着没到点的包。
    pub fn tick(&mut self, packets: &mut PacketList<T>) -> Result<bool, StageError> {
        let mut pending = false;

        for slot in &mut self.slots {
            let enabled = slot.stage.is_enabled();
            let name = slot.stage.descriptor().display_name;

            if enabled && !slot.active {
                slot.stage.start()?;
                slot.active = true;
                slot.ticks = 0;
                info!("stage {} activated", name);
            } else if !enabled && slot.active {
                slot.active = false;
                info!("stage {} deactivated after {} ticks", name, slot.ticks);
                slot.stage.shutdown(packets)?;
            }

            if slot.active {
                slot.ticks += 1;
                pending |= slot.stage.process(packets);
            }
        }

        Ok(pending)
    }

    /// 停掉所有激活中的 Stage，手上的包全部还回链表。
    /// 某个 Stage 出错也继续停后面的，最后返回第一个错误。
    pub fn shutdown(&mut self, packets: &mut PacketList<T>) -> Result<(), StageError> {
        let mut first_err = None;
        for slot in &mut self.slots {
            if !slot.active {
                continue;
            }
            slot.active = false;
            if let Err(e) = slot.stage.shutdown(packets) {
                error!("{}", e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LagConfig;
    use crate::error::TimerError;
    use crate::packet::{Direction, Packet};
    use crate::stage::LagStage;
    use crate::timer::{ManualClock, TimerResource};

    #[derive(Default)]
    struct NoopTimer;

    impl TimerResource for NoopTimer {
        fn begin_period(&mut self) -> Result<(), TimerError> {
            Ok(())
        }
        fn end_period(&mut self) -> Result<(), TimerError> {
            Ok(())
        }
    }

    fn pipeline() -> (Pipeline<()>, LagConfig, ManualClock) {
        let config = LagConfig::new();
        config.set_delay_ms(100).unwrap();
        let clock = ManualClock::new(0);
        let stage: LagStage<(), _, _> = LagStage::new(config.clone(), clock.clone(), NoopTimer);
        let mut pipeline = Pipeline::new();
        pipeline.add(Box::new(stage));
        (pipeline, config, clock)
    }

    #[test]
    fn disabled_stage_is_never_started() {
        let (mut pipeline, _, _) = pipeline();
        let mut list = PacketList::new();
        list.push_back(Packet::new(1, (), Direction::Outbound, 0, 10));

        assert!(!pipeline.tick(&mut list).unwrap());
        assert!(!pipeline.is_active("lag"));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn toggling_enabled_flag_starts_and_drains() {
        let (mut pipeline, config, clock) = pipeline();
        let mut list = PacketList::new();

        config.set_enabled(true);
        list.push_back(Packet::new(1, (), Direction::Outbound, 0, 10));
        list.push_back(Packet::new(2, (), Direction::Inbound, 0, 10));
        assert!(pipeline.tick(&mut list).unwrap());
        assert!(pipeline.is_active("lag"));
        assert!(list.is_empty());

        clock.set(10);
        config.set_enabled(false);
        assert!(!pipeline.tick(&mut list).unwrap());
        assert!(!pipeline.is_active("lag"));
        assert_eq!(list.len(), 2);

        // 再次打开能正常重新激活
        config.set_enabled(true);
        assert!(pipeline.tick(&mut list).unwrap());
        assert!(pipeline.is_active("lag"));
    }

    #[test]
    fn shutdown_returns_buffered_packets() {
        let (mut pipeline, config, _) = pipeline();
        let mut list = PacketList::new();
        config.set_enabled(true);
        for id in 0..10 {
            list.push_back(Packet::new(id, (), Direction::Outbound, 0, 10));
        }
        pipeline.tick(&mut list).unwrap();
        assert!(list.is_empty());

        pipeline.shutdown(&mut list).unwrap();
        assert_eq!(list.len(), 10);
        assert!(!pipeline.is_active("lag"));

        // 已经全停了，再调一次也没事
        pipeline.shutdown(&mut list).unwrap();
    }
}
