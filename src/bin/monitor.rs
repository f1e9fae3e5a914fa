//! 接收端监视器
//!
//! 按宿主 callback 的节拍调用 [`StreamReceiver::process`]，
//! 定期打印延迟、频率、连接状态，退出时输出统计报告。

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;

use shm_audio_bridge::receiver::{ReceiverConfig, StallPolicy, StreamReceiver};
use shm_audio_bridge::shm::{SharedAudioChannel, DEFAULT_SEGMENT_NAME};

/// Shared-memory audio receiver monitor
#[derive(Parser)]
#[command(name = "shm-monitor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Shared memory segment name
    #[arg(short, long, default_value = DEFAULT_SEGMENT_NAME)]
    name: String,

    /// Simulated host sample rate
    #[arg(short, long, default_value = "48000")]
    sample_rate: u32,

    /// Frames per callback
    #[arg(short, long, default_value = "512")]
    block_frames: usize,

    /// Output channels
    #[arg(short, long, default_value = "2")]
    channels: usize,

    /// Generator timeout in milliseconds
    #[arg(short, long, default_value = "500")]
    timeout_ms: u64,

    /// Output silence instead of repeating the last block on a stall
    #[arg(long)]
    no_repeat: bool,

    /// Status report interval in seconds
    #[arg(short, long, default_value = "1")]
    report_secs: u64,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    if cli.sample_rate == 0 || cli.block_frames == 0 || cli.channels == 0 {
        anyhow::bail!("sample rate, block frames and channels must be greater than zero");
    }

    // 传输不可用时降级为静音，和插件的行为一致
    let channel = Arc::new(SharedAudioChannel::open_or_detached(&cli.name));

    let config = ReceiverConfig {
        timeout: Duration::from_millis(cli.timeout_ms),
        stall_policy: if cli.no_repeat {
            StallPolicy::Silence
        } else {
            StallPolicy::RepeatLastBlock
        },
        ..Default::default()
    };

    let mut receiver = StreamReceiver::new(Arc::clone(&channel), config);
    receiver.prepare(cli.sample_rate as f64, cli.block_frames, cli.channels);
    receiver.set_playing(true);

    let display = receiver.display();
    let stats = receiver.stats();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    println!("Shared Memory Monitor");
    println!(
        "Segment: {}{}",
        cli.name,
        if channel.is_attached() { "" } else { " (unavailable)" }
    );
    println!(
        "Host: {}Hz, {} frames, {}ch",
        cli.sample_rate, cli.block_frames, cli.channels
    );
    println!("Press Ctrl+C to stop.\n");

    let mut buffers = vec![vec![0.0f32; cli.block_frames]; cli.channels];
    let period = Duration::from_secs_f64(cli.block_frames as f64 / cli.sample_rate as f64);
    let report_interval = Duration::from_secs(cli.report_secs.max(1));

    let mut next_callback = Instant::now();
    let mut last_report = Instant::now();
    let mut peak = 0.0f32;

    while running.load(Ordering::SeqCst) {
        {
            let mut outputs: Vec<&mut [f32]> =
                buffers.iter_mut().map(|b| b.as_mut_slice()).collect();
            receiver.process(&mut outputs);
        }
        peak = buffers[0].iter().fold(peak, |p, s| p.max(s.abs()));

        if last_report.elapsed() >= report_interval {
            let status = if receiver.is_generator_active() {
                "active"
            } else if display.timeout_detected() {
                "timeout"
            } else {
                "inactive"
            };
            print!(
                "\r  Latency: {:>6.2} ms | Freq: {:>7.1} Hz | Peak: {:.3} | {:<8} | Fresh: {} Replayed: {}    ",
                display.current_latency_ms(),
                display.current_frequency(),
                peak,
                status,
                stats.fresh_count(),
                stats.replayed_count()
            );
            std::io::stdout().flush().ok();
            peak = 0.0;
            last_report = Instant::now();
        }

        // 按 callback 周期节拍，落后时不追赶
        next_callback += period;
        let now = Instant::now();
        if next_callback > now {
            thread::sleep(next_callback - now);
        } else {
            next_callback = now;
        }
    }

    receiver.release();

    println!("\n");
    println!(
        "{}",
        stats.report(cli.block_frames as u32, cli.sample_rate)
    );

    Ok(())
}
