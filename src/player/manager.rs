use crate::core::{
    MediaBuffer, PixelFormat, PlaybackState, PlayerConfig, PlayerError, PlayerFlags, PlayerStatus, Result,
    TimeSource, TrackFormat,
};
use crate::player::audio_player::{default_audio_player_factory, AudioPlayer, AudioPlayerFactory, AudioSink};
use crate::player::event_queue::{EventId, TimedEventQueue};
use crate::player::listener::{MediaEvent, PlayerListener};
use crate::player::playback_events::PlayerEvent;
use crate::player::prefetcher::Prefetcher;
use crate::player::source::{DataSource, ExtractorFactory, FileSource};
use crate::player::track::MediaTrack;
use crate::renderer::{RemoteRenderService, RendererParams, RendererRegistry, VideoRenderer, VideoSurface};
use crate::core::SystemTimeSource;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::fs::File;
use std::process;
use std::sync::{Arc, Weak};
use std::thread;

pub(super) fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 当前同步时钟
pub(super) enum Clock {
    /// 音频播放器充当时钟
    Audio,
    External(Box<dyn TimeSource>),
}

/// 挂起时保存的最后一帧
struct FrameSnapshot {
    data: Vec<u8>,
    color_format: PixelFormat,
    display_width: i32,
    display_height: i32,
    decoded_width: i32,
    decoded_height: i32,
}

/// 挂起快照，由 `resume` 消费
struct SuspensionState {
    source: DataSource,
    flags: PlayerFlags,
    position_us: i64,
    frame: Option<FrameSnapshot>,
}

/// 播放器的全部可变状态，只在持有锁时访问
pub(super) struct ManagerState {
    pub(super) flags: PlayerFlags,
    pub(super) source: Option<DataSource>,

    pub(super) audio_track: Option<Box<dyn MediaTrack>>,
    pub(super) audio_player: Option<Box<dyn AudioPlayer>>,
    pub(super) time_source: Option<Clock>,
    pub(super) video_track: Option<Box<dyn MediaTrack>>,
    /// 视频轨道当前的输出格式
    pub(super) video_format: Option<TrackFormat>,
    pub(super) prefetcher: Option<Arc<dyn Prefetcher>>,
    pub(super) renderer: Option<Box<dyn VideoRenderer>>,

    /// 已读出但还没显示的帧
    pub(super) video_buffer: Option<MediaBuffer>,
    /// 最近显示的帧
    pub(super) last_video_buffer: Option<MediaBuffer>,

    pub(super) duration_us: i64,
    pub(super) video_width: i32,
    pub(super) video_height: i32,
    pub(super) time_source_delta_us: i64,
    pub(super) video_time_us: i64,
    pub(super) seeking: bool,
    pub(super) seek_time_us: i64,
    pub(super) watch_for_audio_seek_complete: bool,
    pub(super) watch_for_audio_eos: bool,

    pub(super) video_event: Option<EventId>,
    pub(super) stream_done_event: Option<EventId>,
    pub(super) buffering_event: Option<EventId>,
    pub(super) audio_status_event: Option<EventId>,
    pub(super) prepare_event: Option<EventId>,

    pub(super) is_async_prepare: bool,
    pub(super) prepare_cancelled: bool,
    pub(super) prepare_result: Option<Result<()>>,
    pub(super) last_error: Option<PlayerError>,
    pub(super) has_played: bool,
    suspension: Option<SuspensionState>,

    pub(super) listener: Option<Arc<dyn PlayerListener>>,
    pub(super) outbox: Vec<MediaEvent>,
    pub(super) surface: Option<Arc<dyn VideoSurface>>,
    pub(super) audio_sink: Option<Arc<dyn AudioSink>>,
    pub(super) audio_player_factory: AudioPlayerFactory,
    pub(super) renderer_registry: RendererRegistry,
    pub(super) remote_service: Option<Arc<dyn RemoteRenderService>>,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            flags: PlayerFlags::empty(),
            source: None,
            audio_track: None,
            audio_player: None,
            time_source: None,
            video_track: None,
            video_format: None,
            prefetcher: None,
            renderer: None,
            video_buffer: None,
            last_video_buffer: None,
            duration_us: -1,
            video_width: -1,
            video_height: -1,
            time_source_delta_us: 0,
            video_time_us: 0,
            seeking: false,
            seek_time_us: 0,
            watch_for_audio_seek_complete: false,
            watch_for_audio_eos: false,
            video_event: None,
            stream_done_event: None,
            buffering_event: None,
            audio_status_event: None,
            prepare_event: None,
            is_async_prepare: false,
            prepare_cancelled: false,
            prepare_result: None,
            last_error: None,
            has_played: false,
            suspension: None,
            listener: None,
            outbox: Vec::new(),
            surface: None,
            audio_sink: None,
            audio_player_factory: default_audio_player_factory(),
            renderer_registry: RendererRegistry::new(),
            remote_service: None,
        }
    }

    /// 排队一条通知，解锁后投递
    pub(super) fn notify(&mut self, event: MediaEvent) {
        if self.listener.is_some() {
            self.outbox.push(event);
        }
    }

    fn playback_state(&self) -> PlaybackState {
        if self.suspension.is_some() {
            PlaybackState::Suspended
        } else if self.flags.contains(PlayerFlags::PREPARING) {
            PlaybackState::Preparing
        } else if self.flags.contains(PlayerFlags::PLAYING) {
            PlaybackState::Playing
        } else if self.flags.contains(PlayerFlags::AT_EOS) {
            if self.last_error.is_some() {
                PlaybackState::Error
            } else {
                PlaybackState::Ended
            }
        } else if self.flags.contains(PlayerFlags::PREPARED) {
            if self.has_played {
                PlaybackState::Paused
            } else {
                PlaybackState::Prepared
            }
        } else if matches!(self.prepare_result, Some(Err(_))) {
            PlaybackState::Error
        } else if self.source.is_some() {
            PlaybackState::SourceSet
        } else {
            PlaybackState::Idle
        }
    }
}

pub(super) struct Shared {
    pub(super) state: Mutex<ManagerState>,
    pub(super) prepared: Condvar,
    pub(super) queue: TimedEventQueue<PlayerEvent>,
    pub(super) config: PlayerConfig,
    pub(super) extractor_factory: Arc<dyn ExtractorFactory>,
    self_ref: Weak<Shared>,
}

/// 播放管理器 - 驱动音视频解码、定时渲染与同步
///
/// 所有状态由一把锁保护，调用方线程和事件队列线程是仅有的两个访问者。
/// 通知在锁释放后投递，监听器里可以直接回调播放器。
pub struct PlaybackManager {
    shared: Arc<Shared>,
}

impl PlaybackManager {
    pub fn new(config: PlayerConfig, extractor_factory: Arc<dyn ExtractorFactory>) -> Result<Self> {
        config.validate()?;
        info!("{} 🎮 创建播放管理器...", log_ctx());
        let shared = Arc::new_cyclic(|weak| Shared {
            state: Mutex::new(ManagerState::new()),
            prepared: Condvar::new(),
            queue: TimedEventQueue::new("playback-events"),
            config,
            extractor_factory,
            self_ref: weak.clone(),
        });
        Ok(Self { shared })
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.shared.config
    }

    pub fn set_listener(&self, listener: Arc<dyn PlayerListener>) {
        self.shared.state.lock().listener = Some(listener);
    }

    pub fn set_surface(&self, surface: Arc<dyn VideoSurface>) {
        self.shared.state.lock().surface = Some(surface);
    }

    pub fn set_audio_sink(&self, sink: Arc<dyn AudioSink>) {
        self.shared.state.lock().audio_sink = Some(sink);
    }

    pub fn set_audio_player_factory(&self, factory: AudioPlayerFactory) {
        self.shared.state.lock().audio_player_factory = factory;
    }

    pub fn set_renderer_registry(&self, registry: RendererRegistry) {
        self.shared.state.lock().renderer_registry = registry;
    }

    pub fn set_remote_render_service(&self, service: Arc<dyn RemoteRenderService>) {
        self.shared.state.lock().remote_service = Some(service);
    }

    pub fn set_data_source_uri(&self, uri: &str) -> Result<()> {
        self.set_data_source_with_headers(uri, HashMap::new())
    }

    /// 记录定位符和请求头；真正的打开推迟到准备阶段
    pub fn set_data_source_with_headers(&self, uri: &str, headers: HashMap<String, String>) -> Result<()> {
        let mut st = self.shared.state.lock();
        self.shared.reset_l(&mut st);
        info!("{} 📂 设置数据源: {} ({} 个请求头)", log_ctx(), uri, headers.len());
        st.source = Some(DataSource::Uri {
            uri: uri.to_string(),
            headers,
        });
        Ok(())
    }

    /// 文件句柄 + 字节区间；句柄在这里校验
    pub fn set_data_source_file(&self, file: File, offset: u64, length: u64) -> Result<()> {
        let mut st = self.shared.state.lock();
        self.shared.reset_l(&mut st);
        let source = FileSource::new(file, offset, length)?;
        info!("{} 📂 设置文件数据源: offset={} length={}", log_ctx(), source.offset(), source.length());
        st.source = Some(DataSource::File(source));
        Ok(())
    }

    /// 同步准备，阻塞到准备完成
    pub fn prepare(&self) -> Result<()> {
        let mut st = self.shared.state.lock();
        let result = self.shared.prepare_l(&mut st);
        self.shared.deliver(st);
        result
    }

    pub fn prepare_async(&self) -> Result<()> {
        let mut st = self.shared.state.lock();
        if st.flags.contains(PlayerFlags::PREPARING) {
            return Err(PlayerError::Busy);
        }
        self.shared.prepare_async_l(&mut st)?;
        // 持锁期间准备事件不会被处理
        st.is_async_prepare = true;
        Ok(())
    }

    pub fn play(&self) -> Result<()> {
        let mut st = self.shared.state.lock();
        let result = self.shared.play_l(&mut st);
        self.shared.deliver(st);
        result
    }

    pub fn pause(&self) -> Result<()> {
        let mut st = self.shared.state.lock();
        self.shared.pause_l(&mut st);
        Ok(())
    }

    pub fn seek_to(&self, time_us: i64) -> Result<()> {
        let mut st = self.shared.state.lock();
        info!("{} ⏩ seek 到 {} ms", log_ctx(), time_us / 1000);
        self.shared.seek_to_l(&mut st, time_us);
        Ok(())
    }

    pub fn suspend(&self) -> Result<()> {
        let mut st = self.shared.state.lock();
        let result = self.shared.suspend_l(&mut st);
        self.shared.deliver(st);
        result
    }

    pub fn resume(&self) -> Result<()> {
        let mut st = self.shared.state.lock();
        let result = self.shared.resume_l(&mut st);
        self.shared.deliver(st);
        result
    }

    /// 完全拆除当前会话，可重复调用
    pub fn reset(&self) {
        let mut st = self.shared.state.lock();
        self.shared.reset_l(&mut st);
        self.shared.deliver(st);
    }

    pub fn set_looping(&self, looping: bool) {
        self.shared.state.lock().flags.set(PlayerFlags::LOOPING, looping);
    }

    pub fn is_playing(&self) -> bool {
        self.shared.state.lock().flags.contains(PlayerFlags::PLAYING)
    }

    pub fn flags(&self) -> PlayerFlags {
        self.shared.state.lock().flags
    }

    /// 所有轨道中最长的时长；未知时为 None
    pub fn duration_us(&self) -> Option<i64> {
        let duration = self.shared.state.lock().duration_us;
        (duration >= 0).then_some(duration)
    }

    pub fn video_dimensions(&self) -> Option<(i32, i32)> {
        let st = self.shared.state.lock();
        (st.video_width >= 0 && st.video_height >= 0).then_some((st.video_width, st.video_height))
    }

    pub fn position_us(&self) -> i64 {
        let st = self.shared.state.lock();
        Shared::position_l(&st)
    }

    pub fn status(&self) -> PlayerStatus {
        let st = self.shared.state.lock();
        PlayerStatus {
            state: st.playback_state(),
            position_us: Shared::position_l(&st),
            duration_us: (st.duration_us >= 0).then_some(st.duration_us),
            video_size: (st.video_width >= 0 && st.video_height >= 0).then_some((st.video_width, st.video_height)),
            looping: st.flags.contains(PlayerFlags::LOOPING),
        }
    }
}

impl Drop for PlaybackManager {
    fn drop(&mut self) {
        self.shared.queue.stop();
        let mut st = self.shared.state.lock();
        self.shared.reset_l(&mut st);
        info!("{} 🗑 播放管理器已释放", log_ctx());
    }
}

impl Shared {
    /// 释放锁后把排队的通知交给监听器
    pub(super) fn deliver(&self, mut st: MutexGuard<'_, ManagerState>) {
        let events = std::mem::take(&mut st.outbox);
        let listener = st.listener.clone();
        drop(st);
        if let Some(listener) = listener {
            for event in events {
                listener.on_event(event);
            }
        }
    }

    fn ensure_queue_started(&self) {
        let weak = self.self_ref.clone();
        self.queue.start(move |id, event| {
            if let Some(shared) = weak.upgrade() {
                shared.dispatch(id, event);
            }
        });
    }

    pub(super) fn prepare_async_l(&self, st: &mut ManagerState) -> Result<()> {
        if st.flags.contains(PlayerFlags::PREPARING) {
            return Err(PlayerError::Busy);
        }
        if st.flags.contains(PlayerFlags::PREPARED) {
            return Err(PlayerError::InvalidState("已经准备完成".to_string()));
        }
        let Some(source) = st.source.as_ref() else {
            return Err(PlayerError::InvalidState("未设置数据源".to_string()));
        };
        info!("{} ⏳ 开始准备: {}", log_ctx(), source.description());

        self.ensure_queue_started();
        st.flags.insert(PlayerFlags::PREPARING);
        st.prepare_result = None;
        st.prepare_event = Some(self.queue.post_event(PlayerEvent::AsyncPrepare));
        Ok(())
    }

    pub(super) fn prepare_l(&self, st: &mut MutexGuard<'_, ManagerState>) -> Result<()> {
        if st.flags.contains(PlayerFlags::PREPARED) {
            return Ok(());
        }
        if self.queue.is_queue_thread() {
            // 队列线程上等不到自己处理准备事件
            warn!("{} ⚠️ 在事件线程上同步准备，返回 Busy", log_ctx());
            return Err(PlayerError::Busy);
        }

        if st.flags.contains(PlayerFlags::PREPARING) {
            debug!("{} 已有准备在进行，返回 Busy", log_ctx());
            return Err(PlayerError::Busy);
        }
        st.is_async_prepare = false;
        self.prepare_async_l(st)?;

        while st.flags.contains(PlayerFlags::PREPARING) {
            self.prepared.wait(st);
        }

        if st.flags.contains(PlayerFlags::PREPARED) {
            Ok(())
        } else {
            Err(st
                .prepare_result
                .clone()
                .and_then(|result| result.err())
                .unwrap_or_else(|| PlayerError::Unknown("准备被取消".to_string())))
        }
    }

    pub(super) fn play_l(&self, st: &mut MutexGuard<'_, ManagerState>) -> Result<()> {
        if st.flags.contains(PlayerFlags::PLAYING) {
            return Ok(());
        }

        if !st.flags.contains(PlayerFlags::PREPARED) {
            self.prepare_l(st)?;
        }

        info!("{} ▶️ 开始播放", log_ctx());
        st.flags.insert(PlayerFlags::PLAYING | PlayerFlags::FIRST_FRAME);
        st.has_played = true;

        let mut deferred_audio_seek = false;

        if st.audio_track.is_some() || st.audio_player.is_some() {
            if let Some(player) = st.audio_player.as_mut() {
                player.resume();
            } else if let Some(sink) = st.audio_sink.clone() {
                let mut player = (st.audio_player_factory)(sink, &self.config.audio);
                if let Some(track) = st.audio_track.take() {
                    player.set_source(track);
                }
                if let Err(e) = player.start() {
                    error!("{} ❌ 音频播放器启动失败: {}", log_ctx(), e);
                    // 轨道留给下一次 play 重试
                    st.audio_track = player.take_source();
                    st.flags.remove(PlayerFlags::PLAYING | PlayerFlags::FIRST_FRAME);
                    return Err(e);
                }

                st.audio_player = Some(player);
                st.time_source = Some(Clock::Audio);
                deferred_audio_seek = true;
                st.watch_for_audio_seek_complete = false;
                st.watch_for_audio_eos = true;
            } else {
                warn!("{} ⚠️ 未设置音频输出，音频轨道不播放", log_ctx());
            }

            self.post_audio_status_l(st);
        }

        if st.time_source.is_none() && st.audio_player.is_none() {
            debug!("{} 没有音频时钟，使用墙钟", log_ctx());
            st.time_source = Some(Clock::External(Box::new(SystemTimeSource::new())));
        }

        if st.video_track.is_some() {
            self.post_video_event_l(st, self.config.video_tick_interval_us);
        }

        if deferred_audio_seek {
            // 暂停期间请求的 seek 在这里生效
            self.seek_audio_if_necessary_l(st);
        }

        self.post_buffering_l(st);

        if st.flags.contains(PlayerFlags::AT_EOS) {
            // 播完之后再次播放，从头开始
            self.seek_to_l(st, 0);
        }

        Ok(())
    }

    pub(super) fn pause_l(&self, st: &mut ManagerState) {
        if !st.flags.contains(PlayerFlags::PLAYING) {
            return;
        }
        info!("{} ⏸ 暂停", log_ctx());

        self.cancel_player_events_l(st, true);
        if let Some(player) = st.audio_player.as_mut() {
            player.pause();
        }
        st.flags.remove(PlayerFlags::PLAYING);
    }

    pub(super) fn seek_to_l(&self, st: &mut ManagerState, time_us: i64) {
        st.seeking = true;
        st.seek_time_us = time_us;
        st.flags.remove(PlayerFlags::AT_EOS);
        self.seek_audio_if_necessary_l(st);
    }

    /// 只有音频时 seek 直接交给音频播放器
    pub(super) fn seek_audio_if_necessary_l(&self, st: &mut ManagerState) {
        if !st.seeking || st.video_track.is_some() {
            return;
        }
        if let Some(player) = st.audio_player.as_mut() {
            player.seek_to(st.seek_time_us);
            st.watch_for_audio_seek_complete = true;
            st.watch_for_audio_eos = true;
            st.seeking = false;
        }
    }

    /// seek 未完成时报告目标位置
    pub(super) fn position_l(st: &ManagerState) -> i64 {
        if st.seeking {
            st.seek_time_us
        } else if st.video_track.is_some() {
            st.video_time_us
        } else if let Some(player) = st.audio_player.as_ref() {
            player.media_time_us()
        } else {
            0
        }
    }

    fn suspend_l(&self, st: &mut MutexGuard<'_, ManagerState>) -> Result<()> {
        if st.suspension.is_some() {
            return Err(PlayerError::InvalidState("已经挂起".to_string()));
        }

        while st.flags.contains(PlayerFlags::PREPARING) {
            if self.queue.is_queue_thread() {
                return Err(PlayerError::InvalidState("准备进行中".to_string()));
            }
            self.prepared.wait(st);
        }

        let Some(source) = st.source.clone() else {
            return Err(PlayerError::InvalidState("没有可挂起的会话".to_string()));
        };

        let flags = st.flags & (PlayerFlags::PLAYING | PlayerFlags::LOOPING | PlayerFlags::AT_EOS);
        let position_us = Self::position_l(st);

        let frame = match (st.last_video_buffer.as_ref(), st.video_format.as_ref()) {
            (Some(buffer), Some(format)) if !buffer.is_empty() => format.color_format.map(|color_format| FrameSnapshot {
                data: buffer.data().to_vec(),
                color_format,
                display_width: st.video_width,
                display_height: st.video_height,
                decoded_width: format.width.unwrap_or(st.video_width),
                decoded_height: format.height.unwrap_or(st.video_height),
            }),
            _ => None,
        };

        info!(
            "{} 💤 挂起: 位置 {} ms, 状态 {:?}, 保存帧 {}",
            log_ctx(),
            position_us / 1000,
            flags,
            frame.is_some()
        );

        self.reset_l(st);

        st.suspension = Some(SuspensionState {
            source,
            flags,
            position_us,
            frame,
        });
        Ok(())
    }

    fn resume_l(&self, st: &mut MutexGuard<'_, ManagerState>) -> Result<()> {
        let Some(state) = st.suspension.take() else {
            return Err(PlayerError::InvalidState("没有挂起的会话".to_string()));
        };
        info!("{} ☀️ 恢复: {} @ {} ms", log_ctx(), state.source.description(), state.position_us / 1000);

        // 文件数据源沿用挂起前的同一个句柄
        self.reset_l(st);
        st.source = Some(state.source);

        self.seek_to_l(st, state.position_us);
        st.flags = state.flags & (PlayerFlags::LOOPING | PlayerFlags::AT_EOS);

        if let (Some(frame), Some(surface)) = (state.frame, st.surface.clone()) {
            let params = RendererParams {
                preview_only: true,
                component: String::new(),
                color_format: frame.color_format,
                surface,
                display_width: frame.display_width,
                display_height: frame.display_height,
                decoded_width: frame.decoded_width,
                decoded_height: frame.decoded_height,
            };
            let mut renderer = st.renderer_registry.create_local(&params, None);
            renderer.render_raw(&frame.data, state.position_us);
            st.renderer = Some(Box::new(renderer));
        }

        if state.flags.contains(PlayerFlags::PLAYING) {
            self.play_l(st)?;
        }
        Ok(())
    }

    pub(super) fn reset_l(&self, st: &mut MutexGuard<'_, ManagerState>) {
        if st.flags.contains(PlayerFlags::PREPARING) {
            st.prepare_cancelled = true;
        }
        while st.flags.contains(PlayerFlags::PREPARING) {
            if !self.queue.is_started() || self.queue.is_queue_thread() {
                // 准备事件不会再被处理，直接撤销
                if let Some(id) = st.prepare_event.take() {
                    self.queue.cancel_event(id);
                }
                st.flags.remove(PlayerFlags::PREPARING);
                st.prepare_result = Some(Err(PlayerError::Unknown("准备被取消".to_string())));
                self.prepared.notify_all();
                break;
            }
            self.prepared.wait(st);
        }
        st.prepare_cancelled = false;

        self.cancel_player_events_l(st, false);

        if let Some(prefetcher) = st.prefetcher.take() {
            let count = Arc::strong_count(&prefetcher);
            if count != 1 {
                error!("{} ❌ 预读器在拆除时仍被 {} 处引用", log_ctx(), count);
                panic!("{}", PlayerError::Fatal(format!("拆除时预读器引用计数为 {}", count)));
            }
        }

        // 先停音频，让拆除在听感上立即生效
        st.audio_track = None;
        st.time_source = None;
        st.audio_player = None;

        st.renderer = None;
        st.last_video_buffer = None;
        st.video_buffer = None;

        if let Some(mut track) = st.video_track.take() {
            track.stop();
        }
        st.video_format = None;

        st.duration_us = -1;
        st.flags = PlayerFlags::empty();
        st.video_width = -1;
        st.video_height = -1;
        st.time_source_delta_us = 0;
        st.video_time_us = 0;
        st.seeking = false;
        st.seek_time_us = 0;
        st.watch_for_audio_seek_complete = false;
        st.watch_for_audio_eos = false;
        st.is_async_prepare = false;
        st.prepare_result = None;
        st.last_error = None;
        st.has_played = false;
        st.source = None;
        st.suspension = None;

        debug!("{} 🧹 会话已拆除", log_ctx());
    }
}
