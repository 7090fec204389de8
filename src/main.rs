use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use log::{info, warn};
use myy_playback::core::{PlayerConfig, VideoFrame};
use myy_playback::player::{ChannelListener, FfmpegExtractorFactory, MediaEvent, PlaybackManager};
use myy_playback::renderer::VideoSurface;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 无界面播放：解码、同步并统计渲染帧数，状态以 JSON 行输出
#[derive(Parser, Debug)]
#[command(name = "myy-playback", version)]
struct Args {
    /// 文件路径或 http/rtsp/rtmp/hls 地址
    locator: String,

    /// 播完后从头循环
    #[arg(long = "loop")]
    looping: bool,

    /// JSON 配置文件
    #[arg(long)]
    config: Option<PathBuf>,

    /// 开始播放前先 seek 到该位置（毫秒）
    #[arg(long)]
    seek_ms: Option<i64>,

    /// 状态输出间隔（毫秒）
    #[arg(long, default_value_t = 1000)]
    status_interval_ms: u64,
}

/// 只计数的显示表面
#[derive(Default)]
struct CountingSurface {
    frames: AtomicU64,
    last_pts_us: AtomicU64,
}

impl VideoSurface for CountingSurface {
    fn post_frame(&self, frame: VideoFrame) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.last_pts_us.store(frame.pts_us.max(0) as u64, Ordering::Relaxed);
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    info!("🎬 myy-playback 启动: {}", args.locator);

    let config = match &args.config {
        Some(path) => PlayerConfig::load(path).with_context(|| format!("加载配置 {} 失败", path.display()))?,
        None => PlayerConfig::default(),
    };

    let factory = FfmpegExtractorFactory::new()?;
    let manager = PlaybackManager::new(config, Arc::new(factory))?;

    let (listener, events) = ChannelListener::new();
    manager.set_listener(Arc::new(listener));

    let surface = Arc::new(CountingSurface::default());
    manager.set_surface(surface.clone());

    #[cfg(feature = "cpal-output")]
    {
        match myy_playback::player::CpalAudioSink::new(&manager.config().audio) {
            Ok(sink) => manager.set_audio_sink(Arc::new(sink)),
            Err(e) => warn!("⚠️ 音频输出不可用，只播放视频: {}", e),
        }
    }

    manager.set_data_source_uri(&args.locator)?;
    manager.set_looping(args.looping);
    manager.prepare()?;
    println!("{}", serde_json::json!({ "prepared": manager.status() }));
    if let Some(ms) = args.seek_ms {
        manager.seek_to(ms * 1000)?;
    }
    manager.play()?;

    let interval = Duration::from_millis(args.status_interval_ms.max(10));
    loop {
        match events.recv_timeout(interval) {
            Ok(event) => {
                println!("{}", serde_json::json!({ "event": event }));
                match event {
                    MediaEvent::PlaybackComplete if !args.looping => break,
                    MediaEvent::Error { code, .. } => {
                        manager.reset();
                        return Err(anyhow!("播放出错 (code {})", code));
                    }
                    _ => {}
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let status = manager.status();
                println!(
                    "{}",
                    serde_json::json!({
                        "status": status,
                        "frames_rendered": surface.frames.load(Ordering::Relaxed),
                        "last_pts_us": surface.last_pts_us.load(Ordering::Relaxed),
                    })
                );
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("⚠️ 通知通道已关闭");
                break;
            }
        }
    }

    info!("✅ 共渲染 {} 帧", surface.frames.load(Ordering::Relaxed));
    manager.reset();
    Ok(())
}
