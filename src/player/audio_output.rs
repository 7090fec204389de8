use crate::core::{AudioConfig, PlayerError, Result};
use crate::player::audio_player::AudioSink;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig, SupportedStreamConfigRange};
use crossbeam::queue::SegQueue;
use crossbeam_channel::{bounded, unbounded, Sender};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

enum Command {
    Open {
        sample_rate: u32,
        channels: u16,
        reply: Sender<Result<()>>,
    },
    Play(Sender<Result<()>>),
    Pause,
    Close,
    Shutdown,
}

/// 回调线程和写入方共享的采样队列
struct SampleQueue {
    samples: SegQueue<f32>,
    queued: AtomicUsize,
}

impl SampleQueue {
    fn clear(&self) {
        while self.samples.pop().is_some() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// cpal 音频输出
///
/// cpal::Stream 不能跨线程，设备由专用线程持有，这里只通过命令通道控制它。
pub struct CpalAudioSink {
    commands: Sender<Command>,
    queue: Arc<SampleQueue>,
    sample_rate: AtomicU32,
    channels: AtomicU32,
    max_queued_ms: u32,
    worker: Option<JoinHandle<()>>,
}

impl CpalAudioSink {
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let (tx, rx) = unbounded::<Command>();
        let queue = Arc::new(SampleQueue {
            samples: SegQueue::new(),
            queued: AtomicUsize::new(0),
        });

        let device_queue = queue.clone();
        let worker = thread::Builder::new()
            .name("cpal-output".to_string())
            .spawn(move || {
                let mut stream: Option<Stream> = None;
                while let Ok(command) = rx.recv() {
                    match command {
                        Command::Open {
                            sample_rate,
                            channels,
                            reply,
                        } => {
                            // 先关掉旧的流再打开新的
                            drop(stream.take());
                            let result = Self::build_stream(&device_queue, sample_rate, channels);
                            let _ = reply.send(result.as_ref().map(|_| ()).map_err(Clone::clone));
                            stream = result.ok();
                        }
                        Command::Play(reply) => {
                            let result = match &stream {
                                Some(stream) => stream
                                    .play()
                                    .map_err(|e| PlayerError::Audio(format!("启动音频流失败: {}", e))),
                                None => Err(PlayerError::Audio("音频输出尚未打开".to_string())),
                            };
                            let _ = reply.send(result);
                        }
                        Command::Pause => {
                            if let Some(stream) = &stream {
                                if let Err(e) = stream.pause() {
                                    warn!("⚠️ 暂停音频流失败: {}", e);
                                }
                            }
                        }
                        Command::Close => stream = None,
                        Command::Shutdown => break,
                    }
                }
                debug!("🔈 音频设备线程退出");
            })
            .map_err(|e| PlayerError::Audio(format!("创建音频设备线程失败: {}", e)))?;

        Ok(Self {
            commands: tx,
            queue,
            sample_rate: AtomicU32::new(0),
            channels: AtomicU32::new(0),
            max_queued_ms: config.max_queued_ms,
            worker: Some(worker),
        })
    }

    fn build_stream(queue: &Arc<SampleQueue>, sample_rate: u32, channels: u16) -> Result<Stream> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::Audio("无法找到音频输出设备".to_string()))?;
        debug!("使用音频设备: {}", device.name().unwrap_or_default());

        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        if !Self::is_supported(&device, &config)? {
            return Err(PlayerError::Audio(format!(
                "音频设备不支持 {} Hz, {} 声道",
                sample_rate, channels
            )));
        }

        let queue = queue.clone();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        *sample = match queue.samples.pop() {
                            Some(value) => {
                                queue.queued.fetch_sub(1, Ordering::AcqRel);
                                value
                            }
                            None => 0.0,
                        };
                    }
                },
                move |err| error!("❌ 音频流错误: {}", err),
                None,
            )
            .map_err(|e| PlayerError::Audio(format!("创建音频流失败: {}", e)))?;

        info!("🔈 音频输出已打开: {} Hz, {} 声道", sample_rate, channels);
        Ok(stream)
    }

    fn is_supported(device: &Device, config: &StreamConfig) -> Result<bool> {
        let supported = device
            .supported_output_configs()
            .map_err(|e| PlayerError::Audio(format!("无法获取支持的音频配置: {}", e)))?;
        let compatible = |range: &SupportedStreamConfigRange| {
            config.channels == range.channels()
                && config.sample_rate.0 >= range.min_sample_rate().0
                && config.sample_rate.0 <= range.max_sample_rate().0
        };
        Ok(supported.into_iter().any(|range| compatible(&range)))
    }

    fn request(&self, make: impl FnOnce(Sender<Result<()>>) -> Command) -> Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.commands
            .send(make(reply_tx))
            .map_err(|_| PlayerError::Audio("音频设备线程已退出".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| PlayerError::Audio("音频设备线程无响应".to_string()))?
    }

    fn capacity(&self) -> usize {
        let rate = self.sample_rate.load(Ordering::Acquire) as usize;
        let channels = self.channels.load(Ordering::Acquire) as usize;
        rate * channels * self.max_queued_ms as usize / 1000
    }
}

impl AudioSink for CpalAudioSink {
    fn open(&self, sample_rate: u32, channels: u16) -> Result<()> {
        self.queue.clear();
        self.request(|reply| Command::Open {
            sample_rate,
            channels,
            reply,
        })?;
        self.sample_rate.store(sample_rate, Ordering::Release);
        self.channels.store(channels as u32, Ordering::Release);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.request(Command::Play)
    }

    fn pause(&self) {
        let _ = self.commands.send(Command::Pause);
    }

    fn flush(&self) {
        self.queue.clear();
    }

    fn stop(&self) {
        let _ = self.commands.send(Command::Close);
        self.queue.clear();
    }

    fn write(&self, samples: &[f32]) -> usize {
        let channels = self.channels.load(Ordering::Acquire) as usize;
        if channels == 0 {
            return 0;
        }
        let free = self.capacity().saturating_sub(self.queue.queued.load(Ordering::Acquire));
        let accepted = free.min(samples.len()) / channels * channels;
        // 先记账再入队，回调线程的减法不会下溢
        self.queue.queued.fetch_add(accepted, Ordering::AcqRel);
        for sample in &samples[..accepted] {
            self.queue.samples.push(*sample);
        }
        accepted
    }

    fn latency_us(&self) -> i64 {
        let rate = self.sample_rate.load(Ordering::Acquire) as i64;
        let channels = self.channels.load(Ordering::Acquire) as i64;
        if rate == 0 || channels == 0 {
            return 0;
        }
        let frames = self.queue.queued.load(Ordering::Acquire) as i64 / channels;
        frames * 1_000_000 / rate
    }
}

impl Drop for CpalAudioSink {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
