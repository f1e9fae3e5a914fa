//! 生成器进程
//!
//! 连接命名共享内存，持续生成正弦波或循环播放音频文件，
//! 直到 Ctrl+C。

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;

use shm_audio_bridge::engine::{self, Generator, GeneratorConfig, GeneratorMode};
use shm_audio_bridge::shm::{SharedAudioChannel, DEFAULT_SEGMENT_NAME};

/// 状态打印间隔
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Shared-memory audio generator
#[derive(Parser)]
#[command(name = "shm-generator")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Shared memory segment name
    #[arg(short, long, default_value = DEFAULT_SEGMENT_NAME)]
    name: String,

    /// Sine frequency in Hz
    #[arg(short, long, default_value = "440")]
    frequency: f32,

    /// Audio file to loop instead of the sine wave
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// Samples per block
    #[arg(short, long, default_value = "1024")]
    block_size: usize,

    /// Write interval as a fraction of the block duration
    #[arg(short, long, default_value = "0.5")]
    refresh_ratio: f64,

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

    let config = GeneratorConfig {
        block_size: cli.block_size,
        refresh_ratio: cli.refresh_ratio,
        ..Default::default()
    };
    config.validate()?;

    // 传输不可用时照常运行，块被丢弃
    let channel = Arc::new(SharedAudioChannel::open_or_detached(&cli.name));

    let mut generator = Generator::new(Arc::clone(&channel), config);
    generator.set_frequency(cli.frequency)?;

    if let Some(ref path) = cli.file {
        let info = generator
            .load_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        generator.switch_mode(GeneratorMode::File)?;
        println!(
            "File: {} ({}Hz {}ch, {})",
            path.display(),
            info.sample_rate,
            info.channels,
            info.codec
        );
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    generator.start()?;

    println!("Shared Memory Generator");
    println!(
        "Segment: {}{}",
        cli.name,
        if channel.is_attached() { "" } else { " (unavailable)" }
    );
    match generator.mode() {
        GeneratorMode::Sine => println!("Mode: sine {} Hz", generator.frequency()),
        GeneratorMode::File => println!("Mode: file"),
    }
    println!("Press Ctrl+C to stop.\n");

    let mut last_status = Instant::now();
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(50));

        if last_status.elapsed() >= STATUS_INTERVAL {
            let stats = generator.stats();
            print!(
                "\r  Target: {:.0} Hz | Written: {} | Dropped: {} | Retries: {}    ",
                engine::target_sample_rate(&channel),
                stats.blocks_written,
                stats.blocks_dropped,
                stats.write_retries
            );
            std::io::stdout().flush().ok();
            last_status = Instant::now();
        }
    }

    generator.stop();

    let stats = generator.stats();
    println!("\n\nStopped.");
    println!(
        "Blocks written: {} | dropped: {} | retries: {}",
        stats.blocks_written, stats.blocks_dropped, stats.write_retries
    );

    Ok(())
}
