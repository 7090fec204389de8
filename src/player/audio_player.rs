use crate::core::{AudioConfig, PlayerError, ReadOptions, Result, TimeSource};
use crate::player::track::MediaTrack;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 音频输出设备
///
/// 同一时刻最多被一个音频播放器独占。样本格式固定为交错 f32。
pub trait AudioSink: Send + Sync {
    fn open(&self, sample_rate: u32, channels: u16) -> Result<()>;

    fn start(&self) -> Result<()>;

    fn pause(&self);

    /// 丢弃已排队但尚未播放的样本
    fn flush(&self);

    fn stop(&self);

    /// 非阻塞写入，返回接受的样本数（按声道数对齐）
    fn write(&self, samples: &[f32]) -> usize;

    /// 已排队、尚未播放的时长（微秒）
    fn latency_us(&self) -> i64;
}

/// 音频播放器：持有音频输出，激活后兼任主时钟
pub trait AudioPlayer: TimeSource {
    fn set_source(&mut self, track: Box<dyn MediaTrack>);

    /// 取回尚未交给送数线程的音频轨道；`start` 失败后用它把轨道还给调用方
    fn take_source(&mut self) -> Option<Box<dyn MediaTrack>>;

    fn start(&mut self) -> Result<()>;

    fn pause(&mut self);

    fn resume(&mut self);

    fn seek_to(&mut self, time_us: i64);

    fn is_seeking(&self) -> bool;

    /// 播到流末尾时返回最终状态（`EndOfStream` 或错误）
    fn reached_eos(&self) -> Option<PlayerError>;

    fn media_time_us(&self) -> i64;

    /// 最近一次的 (真实时间, 媒体时间) 对应关系
    fn media_time_mapping(&self) -> Option<(i64, i64)>;
}

/// 音频播放器工厂
pub type AudioPlayerFactory =
    Arc<dyn Fn(Arc<dyn AudioSink>, &AudioConfig) -> Box<dyn AudioPlayer> + Send + Sync>;

pub fn default_audio_player_factory() -> AudioPlayerFactory {
    Arc::new(|sink, config| Box::new(DefaultAudioPlayer::new(sink, config.clone())))
}

struct AudioState {
    paused: bool,
    stopping: bool,
    seek_to_us: Option<i64>,
    seeking: bool,
    seek_generation: u64,
    last_seek_us: i64,
    reached_eos: Option<PlayerError>,
    sample_rate: u32,
    channels: u16,
    samples_written: u64,
    mapping: Option<(i64, i64)>,
}

impl AudioState {
    fn written_us(&self) -> i64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0;
        }
        let frames = self.samples_written / self.channels as u64;
        (frames as i128 * 1_000_000 / self.sample_rate as i128) as i64
    }
}

struct AudioShared {
    state: Mutex<AudioState>,
    cond: Condvar,
}

/// 默认音频播放器
///
/// 独立的送数线程从音频轨道拉取 PCM 写入输出设备。真实时间按
/// "已写入帧数 - 设备排队时长" 计算，因此暂停时时钟自然停住。
pub struct DefaultAudioPlayer {
    sink: Arc<dyn AudioSink>,
    config: AudioConfig,
    source: Option<Box<dyn MediaTrack>>,
    shared: Arc<AudioShared>,
    worker: Option<JoinHandle<()>>,
}

impl DefaultAudioPlayer {
    pub fn new(sink: Arc<dyn AudioSink>, config: AudioConfig) -> Self {
        Self {
            sink,
            config,
            source: None,
            shared: Arc::new(AudioShared {
                state: Mutex::new(AudioState {
                    paused: false,
                    stopping: false,
                    seek_to_us: None,
                    seeking: false,
                    seek_generation: 0,
                    last_seek_us: 0,
                    reached_eos: None,
                    sample_rate: 0,
                    channels: 0,
                    samples_written: 0,
                    mapping: None,
                }),
                cond: Condvar::new(),
            }),
            worker: None,
        }
    }

    fn feed_loop(shared: Arc<AudioShared>, sink: Arc<dyn AudioSink>, mut track: Box<dyn MediaTrack>) {
        debug!("🔊 音频送数线程启动");
        loop {
            let (seek, generation) = {
                let mut st = shared.state.lock();
                loop {
                    if st.stopping {
                        break;
                    }
                    if st.seek_to_us.is_some() || (!st.paused && st.reached_eos.is_none()) {
                        break;
                    }
                    shared.cond.wait(&mut st);
                }
                if st.stopping {
                    break;
                }
                (st.seek_to_us.take(), st.seek_generation)
            };

            if seek.is_some() {
                sink.flush();
            }

            let result = track.read(ReadOptions { seek_to_us: seek });

            let buffer = {
                let mut st = shared.state.lock();
                if st.seek_generation != generation {
                    // 读取期间又来了新的 seek，结果作废
                    continue;
                }
                if seek.is_some() {
                    st.seeking = false;
                    st.mapping = None;
                }
                match result {
                    Ok(buffer) => {
                        let written_us = st.written_us();
                        st.mapping = Some((written_us, buffer.timestamp_us()));
                        buffer
                    }
                    Err(PlayerError::FormatChanged) => {
                        let format = track.format();
                        if let (Some(rate), Some(channels)) = (format.sample_rate, format.channel_count) {
                            if rate != st.sample_rate || channels != st.channels {
                                warn!("音频格式变化: {} Hz / {} 声道", rate, channels);
                                drop(st);
                                if let Err(e) = sink.open(rate, channels).and_then(|_| sink.start()) {
                                    error!("❌ 重新打开音频输出失败: {}", e);
                                    let mut st = shared.state.lock();
                                    st.reached_eos = Some(e);
                                } else {
                                    let mut st = shared.state.lock();
                                    st.sample_rate = rate;
                                    st.channels = channels;
                                    st.samples_written = 0;
                                    st.mapping = None;
                                }
                            }
                        }
                        continue;
                    }
                    Err(e) => {
                        if e.is_end_of_stream() {
                            info!("🔊 音频轨道播放结束");
                        } else {
                            error!("❌ 音频轨道读取失败: {}", e);
                        }
                        st.reached_eos = Some(e);
                        continue;
                    }
                }
            };

            let samples: Vec<f32> = buffer
                .data()
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            buffer.release();

            let mut offset = 0;
            while offset < samples.len() {
                {
                    let mut st = shared.state.lock();
                    if st.stopping || st.seek_generation != generation {
                        break;
                    }
                    if st.paused {
                        shared.cond.wait_for(&mut st, Duration::from_millis(10));
                        continue;
                    }
                }
                let accepted = sink.write(&samples[offset..]);
                if accepted == 0 {
                    let mut st = shared.state.lock();
                    shared.cond.wait_for(&mut st, Duration::from_millis(5));
                    continue;
                }
                offset += accepted;
                shared.state.lock().samples_written += accepted as u64;
            }
        }

        track.stop();
        debug!("🔊 音频送数线程退出");
    }
}

impl TimeSource for DefaultAudioPlayer {
    fn real_time_us(&self) -> i64 {
        let written_us = self.shared.state.lock().written_us();
        (written_us - self.sink.latency_us()).max(0)
    }
}

impl AudioPlayer for DefaultAudioPlayer {
    fn set_source(&mut self, track: Box<dyn MediaTrack>) {
        self.source = Some(track);
    }

    fn take_source(&mut self) -> Option<Box<dyn MediaTrack>> {
        self.source.take()
    }

    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let mut track = self
            .source
            .take()
            .ok_or_else(|| PlayerError::Audio("音频播放器没有数据源".to_string()))?;

        if let Err(e) = track.start() {
            self.source = Some(track);
            return Err(e);
        }

        let format = track.format();
        let (Some(sample_rate), Some(channels)) = (format.sample_rate, format.channel_count) else {
            track.stop();
            self.source = Some(track);
            return Err(PlayerError::Audio(format!("音频轨道缺少采样率/声道信息: {}", format.mime)));
        };

        if let Err(e) = self.sink.open(sample_rate, channels).and_then(|_| self.sink.start()) {
            track.stop();
            self.source = Some(track);
            return Err(e);
        }

        {
            let mut st = self.shared.state.lock();
            st.sample_rate = sample_rate;
            st.channels = channels;
        }

        info!(
            "🔊 音频播放器启动: {} Hz, {} 声道, 最大排队 {} ms",
            sample_rate, channels, self.config.max_queued_ms
        );

        let shared = self.shared.clone();
        let sink = self.sink.clone();
        let spawned = thread::Builder::new()
            .name("audio-feeder".to_string())
            .spawn(move || Self::feed_loop(shared, sink, track));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.sink.stop();
                Err(PlayerError::Audio(format!("创建音频线程失败: {}", e)))
            }
        }
    }

    fn pause(&mut self) {
        self.shared.state.lock().paused = true;
        self.sink.pause();
    }

    fn resume(&mut self) {
        self.shared.state.lock().paused = false;
        if let Err(e) = self.sink.start() {
            error!("❌ 恢复音频输出失败: {}", e);
        }
        self.shared.cond.notify_all();
    }

    fn seek_to(&mut self, time_us: i64) {
        {
            let mut st = self.shared.state.lock();
            st.seek_to_us = Some(time_us);
            st.last_seek_us = time_us;
            st.seeking = true;
            st.seek_generation += 1;
            st.reached_eos = None;
            st.mapping = None;
        }
        self.shared.cond.notify_all();
    }

    fn is_seeking(&self) -> bool {
        self.shared.state.lock().seeking
    }

    fn reached_eos(&self) -> Option<PlayerError> {
        self.shared.state.lock().reached_eos.clone()
    }

    fn media_time_us(&self) -> i64 {
        let real_us = self.real_time_us();
        let st = self.shared.state.lock();
        match st.mapping {
            Some((mapped_real, mapped_media)) => (mapped_media + real_us - mapped_real).max(0),
            None => st.last_seek_us,
        }
    }

    fn media_time_mapping(&self) -> Option<(i64, i64)> {
        self.shared.state.lock().mapping
    }
}

impl Drop for DefaultAudioPlayer {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.shared.state.lock().stopping = true;
            self.shared.cond.notify_all();
            let _ = handle.join();
            self.sink.stop();
            info!("🔊 音频播放器已释放");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::test_support::{pcm_track, RecordingSink};
    use std::time::Instant;

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_plays_to_eos_and_maps_time() {
        let sink = Arc::new(RecordingSink::new());
        let (track, _log) = pcm_track(48_000, 1, 3, 480);
        let mut player = DefaultAudioPlayer::new(sink.clone(), AudioConfig::default());
        player.set_source(Box::new(track));
        player.start().unwrap();

        assert!(wait_until(|| player.reached_eos().is_some()));
        assert_eq!(player.reached_eos(), Some(PlayerError::EndOfStream));
        assert_eq!(sink.samples_written(), 3 * 480);
        // 3 x 10ms，设备延迟为 0
        assert_eq!(player.real_time_us(), 30_000);
        let (real, media) = player.media_time_mapping().unwrap();
        assert_eq!(real, 20_000);
        assert_eq!(media, 20_000);
        assert_eq!(player.media_time_us(), 30_000);
    }

    #[test]
    fn test_seek_restarts_after_eos() {
        let sink = Arc::new(RecordingSink::new());
        let (track, log) = pcm_track(48_000, 2, 2, 480);
        let mut player = DefaultAudioPlayer::new(sink.clone(), AudioConfig::default());
        player.set_source(Box::new(track));
        player.start().unwrap();
        assert!(wait_until(|| player.reached_eos().is_some()));

        player.seek_to(0);
        assert!(player.reached_eos().is_none());
        assert!(wait_until(|| !player.is_seeking() && player.reached_eos().is_some()));
        assert!(log.seeks().contains(&0));
        assert_eq!(sink.flush_count(), 1);
    }

    #[test]
    fn test_start_without_source_fails() {
        let sink = Arc::new(RecordingSink::new());
        let mut player = DefaultAudioPlayer::new(sink, AudioConfig::default());
        assert!(matches!(player.start(), Err(PlayerError::Audio(_))));
    }

    #[test]
    fn test_sink_open_failure_propagates() {
        let sink = Arc::new(RecordingSink::failing());
        let (track, log) = pcm_track(44_100, 2, 1, 64);
        let mut player = DefaultAudioPlayer::new(sink, AudioConfig::default());
        player.set_source(Box::new(track));
        assert!(matches!(player.start(), Err(PlayerError::Audio(_))));
        assert!(log.stopped());
        // 启动失败后轨道仍可取回
        assert!(player.take_source().is_some());
        assert!(player.take_source().is_none());
    }

    #[test]
    fn test_pause_blocks_feeding() {
        let sink = Arc::new(RecordingSink::new());
        let (track, _log) = pcm_track(48_000, 1, 50, 480);
        let mut player = DefaultAudioPlayer::new(sink.clone(), AudioConfig::default());
        player.pause();
        player.set_source(Box::new(track));
        player.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(sink.samples_written(), 0);
        player.resume();
        assert!(wait_until(|| player.reached_eos().is_some()));
        assert_eq!(sink.samples_written(), 50 * 480);
    }
}
