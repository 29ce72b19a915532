use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nfq::{Message as InnerMessage, Queue, Verdict};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use nfq_lagger::{
    config::{self, DELAY_DEFAULT_MS, JITTER_DEFAULT_MS, LagConfig, Parameters},
    nfq_message::NfqMessage as Message,
    packet::{Direction, Packet},
    packet_list::PacketList,
    pipeline::Pipeline,
    stage::{KEEP_AT_MOST, LagStage, MonitorStage, Stage},
    timer::{HighResTimer, MonotonicClock},
};

const BATCH_LIMIT: usize = 10000;
const QUEUE_MAX_LEN: u32 = 10000;

#[derive(Parser, Debug)]
#[command(
    name = "nfq_lagger",
    version,
    about = "Delay and jitter emulation for NFQUEUE traffic"
)]
struct Cli {
    /// NFQUEUE number carrying inbound traffic
    #[arg(long, default_value_t = 0)]
    inbound_queue: u16,
    /// NFQUEUE number carrying outbound traffic
    #[arg(long, default_value_t = 1)]
    outbound_queue: u16,

    /// Delay in ms (0-15000)
    #[arg(long, default_value_t = DELAY_DEFAULT_MS)]
    delay: u32,
    /// Jitter upper bound in ms, exclusive (0-2000)
    #[arg(long, default_value_t = JITTER_DEFAULT_MS)]
    jitter: u32,
    #[arg(long)]
    no_inbound: bool,
    #[arg(long)]
    no_outbound: bool,
    /// Start with lag switched off (turn on later with `lag on` on stdin)
    #[arg(long)]
    disabled: bool,

    /// Stage parameter, e.g. `lag-time=120` (repeatable, overrides flags)
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,
    /// JSON file of stage parameters, applied before --param
    #[arg(long)]
    params_file: Option<PathBuf>,
    /// Write the persistable lag parameters here on exit
    #[arg(long)]
    save_params: Option<PathBuf>,

    /// Print a per-second dashboard
    #[arg(long)]
    monitor: bool,
}

fn make_queue(queue_num: u16) -> Result<Queue, std::io::Error> {
    let mut q = Queue::open()?;
    q.bind(queue_num)?;
    q.set_copy_range(queue_num, 0xFFFF)?;
    q.set_queue_max_len(queue_num, QUEUE_MAX_LEN)?;
    q.set_nonblocking(true);
    Ok(q)
}

fn build_config(args: &Cli) -> Result<LagConfig> {
    let config = LagConfig::new();
    config.set_enabled(!args.disabled);
    config.set_inbound(!args.no_inbound);
    config.set_outbound(!args.no_outbound);
    config.set_delay_ms(args.delay).context("invalid --delay")?;
    config.set_jitter_ms(args.jitter).context("invalid --jitter")?;
    Ok(config)
}

fn load_params(args: &Cli) -> Result<Parameters> {
    let mut params = match &args.params_file {
        Some(path) => Parameters::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Parameters::new(),
    };
    params.merge(Parameters::from_pairs(args.params.iter().map(String::as_str))?);
    Ok(params)
}

// 链表里剩下的包全部放行
fn send_all(packets: &mut PacketList<Message>, queues: &mut [(Queue, Direction)]) -> bool {
    let mut sent = false;
    while let Some(pkt) = packets.pop_front() {
        sent = true;
        let mut msg: InnerMessage = pkt.msg.into();
        msg.set_verdict(Verdict::Accept);
        if let Err(e) = queues[pkt.queue_num].0.verdict(msg) {
            warn!("verdict failed on queue index {}: {}", pkt.queue_num, e);
        }
    }
    sent
}

fn run(
    pipeline: &mut Pipeline<Message>,
    packets: &mut PacketList<Message>,
    queues: &mut [(Queue, Direction)],
    stop: &AtomicBool,
) -> Result<()> {
    let mut next_id: u64 = 0;

    while !stop.load(Ordering::Relaxed) {
        let mut working = false;

        // 1. 收包：所有队列轮流读，直到都读空或者到批量上限
        let mut packet_count = 0;
        loop {
            if packet_count >= BATCH_LIMIT {
                break;
            }
            let mut no_packet = true;
            for (i, (queue, direction)) in queues.iter_mut().enumerate() {
                match queue.recv() {
                    Ok(msg) => {
                        working = true;
                        packet_count += 1;
                        no_packet = false;

                        let msg = Message::from(msg);
                        let pkt_len = msg.len();
                        packets.push_back(Packet::new(next_id, msg, *direction, i, pkt_len));
                        next_id = next_id.wrapping_add(1);
                    }
                    Err(_) => continue,
                }
            }
            if no_packet {
                break;
            }
        }

        // 2. 各 Stage 过一遍
        let pending = pipeline.tick(packets).context("pipeline tick failed")?;

        // 3. 发包
        if send_all(packets, queues) {
            working = true;
        }

        if !working {
            // 缓冲区里有包等着到点，睡短一点
            let nap = if pending { 100 } else { 1000 };
            std::thread::sleep(Duration::from_micros(nap));
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Cli::parse();

    let config = build_config(&args)?;
    let params = load_params(&args)?;

    let lag: LagStage<Message, _, _> =
        LagStage::new(config.clone(), MonotonicClock::new(), HighResTimer::new());
    let stage: Box<dyn Stage<Message>> = if args.monitor {
        Box::new(MonitorStage::new(Box::new(lag)))
    } else {
        Box::new(lag)
    };
    let short_name = stage.descriptor().short_name;

    let mut pipeline = Pipeline::new();
    pipeline.add(stage);
    pipeline.setup(&params).context("failed to apply stage parameters")?;

    config::spawn_config_listener(config.clone(), short_name);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
            .context("failed to install Ctrl+C handler")?;
    }

    let mut queues = vec![
        (
            make_queue(args.inbound_queue)
                .with_context(|| format!("failed to open queue {}", args.inbound_queue))?,
            Direction::Inbound,
        ),
        (
            make_queue(args.outbound_queue)
                .with_context(|| format!("failed to open queue {}", args.outbound_queue))?,
            Direction::Outbound,
        ),
    ];
    info!(
        "lagging inbound queue {} / outbound queue {}",
        args.inbound_queue, args.outbound_queue
    );

    let mut packets = PacketList::with_capacity(KEEP_AT_MOST * 2);
    let result = run(&mut pipeline, &mut packets, &mut queues, &stop);

    // 不管怎么退出，缓冲区里的包都要还回去放行
    if let Err(e) = pipeline.shutdown(&mut packets) {
        error!("shutdown: {}", e);
    }
    send_all(&mut packets, &mut queues);

    if let Some(path) = &args.save_params {
        config
            .to_parameters(short_name)
            .save(path)
            .with_context(|| format!("failed to save {}", path.display()))?;
        info!("parameters saved to {}", path.display());
    }

    result
}
