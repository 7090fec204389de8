// 单元测试用的假实现

use crate::core::{
    MediaBuffer, PixelFormat, PlayerError, ReadOptions, Result, TimeSource, TrackFormat, VideoFrame,
};
use crate::player::audio_player::AudioSink;
use crate::player::listener::{MediaEvent, PlayerListener};
use crate::player::source::{DataSource, ExtractorFactory, MediaExtractor};
use crate::player::track::MediaTrack;
use crate::renderer::VideoSurface;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// 脚本化轨道的一步
#[derive(Debug, Clone)]
pub enum Step {
    Frame { timestamp_us: i64, data: Vec<u8> },
    /// 零长度缓冲区
    Empty(i64),
    FormatChanged(TrackFormat),
    Error(PlayerError),
}

impl Step {
    fn timestamp_us(&self) -> Option<i64> {
        match self {
            Step::Frame { timestamp_us, .. } | Step::Empty(timestamp_us) => Some(*timestamp_us),
            _ => None,
        }
    }
}

#[derive(Default)]
struct LogInner {
    seeks: Vec<i64>,
    reads: usize,
    started: bool,
    stopped: bool,
}

/// 轨道调用记录
#[derive(Default)]
pub struct TrackLog {
    inner: Mutex<LogInner>,
    acquired: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl TrackLog {
    pub fn seeks(&self) -> Vec<i64> {
        self.inner.lock().seeks.clone()
    }

    pub fn reads(&self) -> usize {
        self.inner.lock().reads
    }

    pub fn started(&self) -> bool {
        self.inner.lock().started
    }

    pub fn stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// 仍在调用方手里的缓冲区数量
    pub fn outstanding(&self) -> usize {
        self.acquired() - self.released()
    }
}

/// 按脚本逐步返回缓冲区的轨道
pub struct ScriptedTrack {
    format: TrackFormat,
    steps: Vec<Step>,
    position: usize,
    fail_start: bool,
    log: Arc<TrackLog>,
}

impl ScriptedTrack {
    pub fn new(format: TrackFormat, steps: Vec<Step>) -> (Self, Arc<TrackLog>) {
        let log = Arc::new(TrackLog::default());
        let track = Self {
            format,
            steps,
            position: 0,
            fail_start: false,
            log: log.clone(),
        };
        (track, log)
    }

    pub fn insert_step(&mut self, index: usize, step: Step) {
        self.steps.insert(index, step);
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    fn buffer(&self, data: Vec<u8>, timestamp_us: i64) -> MediaBuffer {
        self.log.acquired.fetch_add(1, Ordering::SeqCst);
        let released = self.log.released.clone();
        MediaBuffer::new(data, timestamp_us)
            .with_buffer_id(self.position as u64)
            .with_release_hook(move || {
                released.fetch_add(1, Ordering::SeqCst);
            })
    }
}

impl MediaTrack for ScriptedTrack {
    fn start(&mut self) -> Result<()> {
        if self.fail_start {
            return Err(PlayerError::Decode("scripted start failure".to_string()));
        }
        self.log.inner.lock().started = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.log.inner.lock().stopped = true;
    }

    fn format(&self) -> TrackFormat {
        self.format.clone()
    }

    fn read(&mut self, options: ReadOptions) -> Result<MediaBuffer> {
        {
            let mut log = self.log.inner.lock();
            log.reads += 1;
            if let Some(time_us) = options.seek_to_us {
                log.seeks.push(time_us);
            }
        }
        if let Some(time_us) = options.seek_to_us {
            self.position = self
                .steps
                .iter()
                .position(|step| step.timestamp_us().is_some_and(|ts| ts >= time_us))
                .unwrap_or(self.steps.len());
        }

        let Some(step) = self.steps.get(self.position).cloned() else {
            return Err(PlayerError::EndOfStream);
        };
        self.position += 1;
        match step {
            Step::Frame { timestamp_us, data } => Ok(self.buffer(data, timestamp_us)),
            Step::Empty(timestamp_us) => Ok(self.buffer(Vec::new(), timestamp_us)),
            Step::FormatChanged(format) => {
                self.format = format;
                Err(PlayerError::FormatChanged)
            }
            Step::Error(e) => Err(e),
        }
    }
}

pub fn pcm_format(sample_rate: u32, channels: u16) -> TrackFormat {
    TrackFormat::new("audio/raw").with_audio(sample_rate, channels)
}

/// 每个缓冲区 `frames` 帧的 f32 PCM，时间戳连续
pub fn pcm_steps(sample_rate: u32, channels: u16, buffers: usize, frames: usize) -> Vec<Step> {
    let bytes: Vec<u8> = std::iter::repeat(0.25f32.to_ne_bytes())
        .take(frames * channels as usize)
        .flatten()
        .collect();
    (0..buffers)
        .map(|i| Step::Frame {
            timestamp_us: (i * frames) as i64 * 1_000_000 / sample_rate as i64,
            data: bytes.clone(),
        })
        .collect()
}

pub fn pcm_track(sample_rate: u32, channels: u16, buffers: usize, frames: usize) -> (ScriptedTrack, Arc<TrackLog>) {
    ScriptedTrack::new(
        pcm_format(sample_rate, channels),
        pcm_steps(sample_rate, channels, buffers, frames),
    )
}

pub fn video_format(frames: usize, interval_us: i64, width: i32, height: i32) -> TrackFormat {
    TrackFormat::new("video/raw")
        .with_duration_us(frames as i64 * interval_us)
        .with_size(width, height)
        .with_color_format(PixelFormat::RGBA)
        .with_decoder_component("soft.raw")
}

/// RGBA 帧，时间戳从 0 开始按 `interval_us` 递增
pub fn video_steps(frames: usize, interval_us: i64, width: i32, height: i32) -> Vec<Step> {
    let size = PixelFormat::RGBA.frame_size(width as usize, height as usize);
    (0..frames)
        .map(|i| Step::Frame {
            timestamp_us: i as i64 * interval_us,
            data: vec![i as u8; size],
        })
        .collect()
}

pub fn video_track(frames: usize, interval_us: i64, width: i32, height: i32) -> (ScriptedTrack, Arc<TrackLog>) {
    ScriptedTrack::new(
        video_format(frames, interval_us, width, height),
        video_steps(frames, interval_us, width, height),
    )
}

#[derive(Default)]
struct SinkState {
    opened: Option<(u32, u16)>,
    samples_written: usize,
    flushes: usize,
    playing: bool,
}

/// 立即接受所有样本、延迟为 0 的音频输出
#[derive(Default)]
pub struct RecordingSink {
    state: Mutex<SinkState>,
    fail_open: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub fn samples_written(&self) -> usize {
        self.state.lock().samples_written
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }

    pub fn opened(&self) -> Option<(u32, u16)> {
        self.state.lock().opened
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }
}

impl AudioSink for RecordingSink {
    fn open(&self, sample_rate: u32, channels: u16) -> Result<()> {
        if self.fail_open {
            return Err(PlayerError::Audio("no output device".to_string()));
        }
        self.state.lock().opened = Some((sample_rate, channels));
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.state.lock().playing = true;
        Ok(())
    }

    fn pause(&self) {
        self.state.lock().playing = false;
    }

    fn flush(&self) {
        self.state.lock().flushes += 1;
    }

    fn stop(&self) {
        self.state.lock().playing = false;
    }

    fn write(&self, samples: &[f32]) -> usize {
        self.state.lock().samples_written += samples.len();
        samples.len()
    }

    fn latency_us(&self) -> i64 {
        0
    }
}

#[derive(Default)]
pub struct RecordingSurface {
    frames: Mutex<Vec<VideoFrame>>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<VideoFrame> {
        self.frames.lock().clone()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }
}

impl VideoSurface for RecordingSurface {
    fn post_frame(&self, frame: VideoFrame) {
        self.frames.lock().push(frame);
    }
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<MediaEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MediaEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &MediaEvent) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }
}

impl PlayerListener for RecordingListener {
    fn on_event(&self, event: MediaEvent) {
        self.events.lock().push(event);
    }
}

/// 手动推进的时钟
#[derive(Clone, Default)]
pub struct ManualClock {
    now_us: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(now_us: i64) -> Self {
        Self {
            now_us: Arc::new(AtomicI64::new(now_us)),
        }
    }

    pub fn set(&self, now_us: i64) {
        self.now_us.store(now_us, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_us: i64) {
        self.now_us.fetch_add(delta_us, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn real_time_us(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct FakeTrackSpec {
    format: TrackFormat,
    /// None 表示挂接失败
    steps: Option<Vec<Step>>,
}

/// 内存里的解封装器工厂
#[derive(Clone, Default)]
pub struct FakeExtractorFactory {
    tracks: Vec<FakeTrackSpec>,
    wants_prefetching: bool,
    open_error: Option<PlayerError>,
    open_delay: Duration,
    opened: Arc<Mutex<Vec<String>>>,
    logs: Arc<Mutex<Vec<Arc<TrackLog>>>>,
}

impl FakeExtractorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_track(mut self, format: TrackFormat, steps: Vec<Step>) -> Self {
        self.tracks.push(FakeTrackSpec {
            format,
            steps: Some(steps),
        });
        self
    }

    pub fn with_broken_track(mut self, format: TrackFormat) -> Self {
        self.tracks.push(FakeTrackSpec { format, steps: None });
        self
    }

    pub fn with_prefetching(mut self) -> Self {
        self.wants_prefetching = true;
        self
    }

    pub fn with_open_error(mut self, error: PlayerError) -> Self {
        self.open_error = Some(error);
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// 打开过的数据源描述
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }

    /// 按挂接顺序排列的轨道记录
    pub fn logs(&self) -> Vec<Arc<TrackLog>> {
        self.logs.lock().clone()
    }
}

impl ExtractorFactory for FakeExtractorFactory {
    fn open(&self, source: &DataSource) -> Result<Box<dyn MediaExtractor>> {
        if !self.open_delay.is_zero() {
            thread::sleep(self.open_delay);
        }
        self.opened.lock().push(source.description());
        if let Some(e) = &self.open_error {
            return Err(e.clone());
        }
        Ok(Box::new(FakeExtractor {
            tracks: self.tracks.clone(),
            wants_prefetching: self.wants_prefetching,
            logs: self.logs.clone(),
        }))
    }
}

struct FakeExtractor {
    tracks: Vec<FakeTrackSpec>,
    wants_prefetching: bool,
    logs: Arc<Mutex<Vec<Arc<TrackLog>>>>,
}

impl MediaExtractor for FakeExtractor {
    fn count_tracks(&self) -> usize {
        self.tracks.len()
    }

    fn track_format(&self, index: usize) -> Option<TrackFormat> {
        self.tracks.get(index).map(|spec| spec.format.clone())
    }

    fn get_track(&mut self, index: usize) -> Result<Box<dyn MediaTrack>> {
        let spec = self
            .tracks
            .get(index)
            .ok_or_else(|| PlayerError::TrackAttach(format!("no track {}", index)))?;
        let steps = spec
            .steps
            .clone()
            .ok_or_else(|| PlayerError::TrackAttach(spec.format.mime.clone()))?;
        let (track, log) = ScriptedTrack::new(spec.format.clone(), steps);
        self.logs.lock().push(log);
        Ok(Box::new(track))
    }

    fn wants_prefetching(&self) -> bool {
        self.wants_prefetching
    }
}
