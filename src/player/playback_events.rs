use crate::core::{PlayerError, PlayerFlags, ReadOptions, Result, TrackKind};
use crate::player::event_queue::EventId;
use crate::player::listener::{ErrorKind, MediaEvent};
use crate::player::manager::{log_ctx, Clock, ManagerState, Shared};
use crate::player::prefetcher::{Prefetcher, ReadAheadPrefetcher};
use crate::player::source::DataSource;
use crate::player::track::MediaTrack;
use crate::renderer::{create_renderer, RendererParams};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;

/// 事件队列里的播放器事件
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    VideoTick,
    StreamDone { status: PlayerError },
    BufferingTick,
    AudioStatusTick,
    AsyncPrepare,
}

/// 准备阶段在锁外挂接好的轨道
struct AttachedTracks {
    audio: Option<Box<dyn MediaTrack>>,
    video: Option<Box<dyn MediaTrack>>,
    prefetcher: Option<Arc<dyn Prefetcher>>,
}

impl AttachedTracks {
    fn shutdown(self) {
        if let Some(mut video) = self.video {
            video.stop();
        }
    }
}

impl Shared {
    pub(super) fn dispatch(&self, id: EventId, event: PlayerEvent) {
        match event {
            PlayerEvent::VideoTick => self.on_video_event(id),
            PlayerEvent::StreamDone { status } => self.on_stream_done(id, status),
            PlayerEvent::BufferingTick => self.on_buffering_update(id),
            PlayerEvent::AudioStatusTick => self.on_check_audio_status(id),
            PlayerEvent::AsyncPrepare => self.on_prepare_async_event(id),
        }
    }

    pub(super) fn post_video_event_l(&self, st: &mut ManagerState, delay_us: i64) {
        if st.video_event.is_some() {
            return;
        }
        st.video_event = Some(self.queue.post_event_with_delay(PlayerEvent::VideoTick, delay_us));
    }

    pub(super) fn post_stream_done_l(&self, st: &mut ManagerState, status: PlayerError) {
        if st.stream_done_event.is_some() {
            return;
        }
        st.stream_done_event = Some(self.queue.post_event(PlayerEvent::StreamDone { status }));
    }

    pub(super) fn post_buffering_l(&self, st: &mut ManagerState) {
        if st.prefetcher.is_none() || st.buffering_event.is_some() {
            return;
        }
        st.buffering_event = Some(
            self.queue
                .post_event_with_delay(PlayerEvent::BufferingTick, self.config.buffering_interval_us),
        );
    }

    pub(super) fn post_audio_status_l(&self, st: &mut ManagerState) {
        if st.audio_player.is_none() || st.audio_status_event.is_some() {
            return;
        }
        st.audio_status_event = Some(
            self.queue
                .post_event_with_delay(PlayerEvent::AudioStatusTick, self.config.audio_status_interval_us),
        );
    }

    /// 撤销事件并清掉对应的挂起标记
    pub(super) fn cancel_player_events_l(&self, st: &mut ManagerState, keep_buffering: bool) {
        let mut pending = vec![
            st.video_event.take(),
            st.stream_done_event.take(),
            st.audio_status_event.take(),
        ];
        if !keep_buffering {
            pending.push(st.buffering_event.take());
        }
        for id in pending.into_iter().flatten() {
            self.queue.cancel_event(id);
        }
    }

    fn real_time_us_l(st: &ManagerState) -> i64 {
        match &st.time_source {
            Some(Clock::Audio) => st.audio_player.as_ref().map_or(0, |player| player.real_time_us()),
            Some(Clock::External(source)) => source.real_time_us(),
            None => 0,
        }
    }

    pub(super) fn on_video_event(&self, id: EventId) {
        let mut st = self.state.lock();
        if st.video_event != Some(id) {
            // 出堆之后、拿到锁之前已被撤销
            return;
        }
        st.video_event = None;
        self.video_tick_l(&mut st);
        self.deliver(st);
    }

    pub(super) fn video_tick_l(&self, st: &mut ManagerState) {
        if st.seeking {
            st.last_video_buffer = None;
            st.video_buffer = None;
        }

        if st.video_buffer.is_none() {
            let mut options = if st.seeking {
                debug!("{} 视频 seek 到 {} ms", log_ctx(), st.seek_time_us / 1000);
                ReadOptions::seek_to(st.seek_time_us)
            } else {
                ReadOptions::default()
            };
            loop {
                let Some(track) = st.video_track.as_mut() else {
                    return;
                };
                let result = track.read(options);
                options = ReadOptions::default();

                match result {
                    Ok(buffer) if buffer.is_empty() => {
                        // 有的解码器会吐出空缓冲区，丢掉重读
                        trace!("{} 丢弃空视频缓冲区", log_ctx());
                    }
                    Ok(buffer) => {
                        st.video_buffer = Some(buffer);
                        break;
                    }
                    Err(PlayerError::FormatChanged) => self.on_video_format_changed_l(st),
                    Err(status) => {
                        if status.is_end_of_stream() {
                            info!("{} 🏁 视频流结束", log_ctx());
                        } else {
                            error!("{} ❌ 视频读取失败: {}", log_ctx(), status);
                        }
                        self.post_stream_done_l(st, status);
                        return;
                    }
                }
            }
        }

        let Some(time_us) = st.video_buffer.as_ref().map(|buffer| buffer.timestamp_us()) else {
            return;
        };
        st.video_time_us = time_us;

        if st.seeking {
            if let Some(player) = st.audio_player.as_mut() {
                player.seek_to(time_us);
                st.watch_for_audio_seek_complete = true;
                st.watch_for_audio_eos = true;
            } else {
                // 只有视频时立即报告 seek 完成，否则等音频
                st.notify(MediaEvent::SeekComplete);
            }
            st.flags.insert(PlayerFlags::FIRST_FRAME);
            st.seeking = false;
        }

        let mapping = st.audio_player.as_ref().and_then(|player| player.media_time_mapping());

        if st.flags.contains(PlayerFlags::FIRST_FRAME) {
            st.flags.remove(PlayerFlags::FIRST_FRAME);
            st.time_source_delta_us = match mapping {
                Some((real_us, media_us)) => real_us - media_us,
                None => Self::real_time_us_l(st) - time_us,
            };
        }

        if let Some((real_us, media_us)) = mapping {
            st.time_source_delta_us = real_us - media_us;
        }

        let now_us = Self::real_time_us_l(st) - st.time_source_delta_us;
        let lateness_us = now_us - time_us;

        if lateness_us > self.config.late_frame_threshold_us {
            trace!("{} 视频帧迟到 {} ms，丢弃 (pts={})", log_ctx(), lateness_us / 1000, time_us);
            st.video_buffer = None;
            self.post_video_event_l(st, 0);
            return;
        }

        if lateness_us < -self.config.early_frame_threshold_us {
            trace!("{} 视频帧提前 {} ms，稍后再试", log_ctx(), -lateness_us / 1000);
            self.post_video_event_l(st, self.config.video_tick_interval_us);
            return;
        }

        if st.renderer.as_ref().map_or(true, |renderer| renderer.is_preview_only()) {
            self.init_renderer_l(st);
        }

        if let (Some(renderer), Some(buffer)) = (st.renderer.as_mut(), st.video_buffer.as_ref()) {
            renderer.render(buffer);
        }

        st.last_video_buffer = st.video_buffer.take();
        self.post_video_event_l(st, self.config.video_tick_interval_us);
    }

    fn on_video_format_changed_l(&self, st: &mut ManagerState) {
        let Some(format) = st.video_track.as_ref().map(|track| track.format()) else {
            return;
        };
        info!(
            "{} 🔄 视频格式变化: {:?} {:?}x{:?}",
            log_ctx(),
            format.color_format,
            format.width,
            format.height
        );

        if let (Some(width), Some(height)) = (format.width, format.height) {
            if (width, height) != (st.video_width, st.video_height) {
                st.video_width = width;
                st.video_height = height;
                st.notify(MediaEvent::VideoSizeChanged { width, height });
            }
        }
        st.video_format = Some(format);

        if st.renderer.is_some() {
            self.init_renderer_l(st);
        }
    }

    /// 按当前视频格式重建渲染器；没有显示表面时不渲染
    pub(super) fn init_renderer_l(&self, st: &mut ManagerState) {
        st.renderer = None;

        let (Some(surface), Some(format)) = (st.surface.clone(), st.video_format.as_ref()) else {
            return;
        };
        let Some(color_format) = format.color_format else {
            warn!("{} ⚠️ 视频格式缺少颜色格式，无法渲染", log_ctx());
            return;
        };

        let params = RendererParams {
            preview_only: false,
            component: format.decoder_component.clone().unwrap_or_default(),
            color_format,
            surface,
            display_width: st.video_width,
            display_height: st.video_height,
            decoded_width: format.width.unwrap_or(st.video_width),
            decoded_height: format.height.unwrap_or(st.video_height),
        };
        debug!("{} 🎨 创建渲染器: {:?}", log_ctx(), params);
        st.renderer = Some(create_renderer(
            &params,
            &self.config,
            &st.renderer_registry,
            st.remote_service.as_ref(),
        ));
    }

    fn on_stream_done(&self, id: EventId, status: PlayerError) {
        let mut st = self.state.lock();
        if st.stream_done_event != Some(id) {
            return;
        }
        st.stream_done_event = None;

        if status.is_end_of_stream() && st.flags.contains(PlayerFlags::LOOPING) {
            info!("{} 🔁 循环播放，回到开头", log_ctx());
            self.seek_to_l(&mut st, 0);
            if st.video_track.is_some() {
                self.post_video_event_l(&mut st, self.config.video_tick_interval_us);
            }
        } else {
            if status.is_end_of_stream() {
                info!("{} ✅ 播放完成", log_ctx());
                st.notify(MediaEvent::PlaybackComplete);
            } else {
                error!("{} ❌ 播放出错: {}", log_ctx(), status);
                st.notify(MediaEvent::Error {
                    kind: ErrorKind::Unknown,
                    code: status.code(),
                });
                st.last_error = Some(status);
            }
            self.pause_l(&mut st);
            st.flags.insert(PlayerFlags::AT_EOS);
        }

        self.deliver(st);
    }

    fn on_buffering_update(&self, id: EventId) {
        let mut st = self.state.lock();
        if st.buffering_event != Some(id) {
            return;
        }
        st.buffering_event = None;

        let Some(prefetcher) = st.prefetcher.as_ref() else {
            return;
        };
        if st.duration_us < 0 {
            return;
        }

        let percent = if prefetcher.is_exhausted() || st.duration_us == 0 {
            100
        } else {
            let ahead_us = prefetcher.cached_duration_us() + Self::position_l(&st);
            (ahead_us.saturating_mul(100) / st.duration_us).clamp(0, 100) as i32
        };
        debug!("{} 📶 缓冲进度 {}%", log_ctx(), percent);

        st.notify(MediaEvent::BufferingUpdate(percent));
        self.post_buffering_l(&mut st);
        self.deliver(st);
    }

    fn on_check_audio_status(&self, id: EventId) {
        let mut st = self.state.lock();
        if st.audio_status_event != Some(id) {
            return;
        }
        st.audio_status_event = None;

        let Some(player) = st.audio_player.as_ref() else {
            return;
        };
        let seek_done = st.watch_for_audio_seek_complete && !player.is_seeking();
        let final_status = if st.watch_for_audio_eos {
            player.reached_eos()
        } else {
            None
        };

        if seek_done {
            st.watch_for_audio_seek_complete = false;
            st.notify(MediaEvent::SeekComplete);
        }
        if let Some(status) = final_status {
            st.watch_for_audio_eos = false;
            self.post_stream_done_l(&mut st, status);
        }

        self.post_audio_status_l(&mut st);
        self.deliver(st);
    }

    fn on_prepare_async_event(&self, id: EventId) {
        let source = {
            let mut st = self.state.lock();
            if st.prepare_event != Some(id) {
                return;
            }
            st.prepare_event = None;
            st.source.clone()
        };

        // 打开数据源和预读都可能阻塞在 I/O 上，不持锁；
        // PREPARING 期间 reset/suspend 会等待，状态不会被拆掉
        let attached = match source {
            Some(source) => self.attach_tracks(&source),
            None => Err(PlayerError::InvalidState("未设置数据源".to_string())),
        };

        let mut st = self.state.lock();
        if st.prepare_cancelled {
            info!("{} 准备被取消", log_ctx());
            drop(st);
            if let Ok(tracks) = attached {
                tracks.shutdown();
            }
            let mut st = self.state.lock();
            st.is_async_prepare = false;
            self.finish_prepare_l(&mut st, Err(PlayerError::Unknown("准备被取消".to_string())));
            self.deliver(st);
            return;
        }

        let result = attached.map(|tracks| self.install_tracks_l(&mut st, tracks));
        self.finish_prepare_l(&mut st, result);
        self.deliver(st);
    }

    fn attach_tracks(&self, source: &DataSource) -> Result<AttachedTracks> {
        let mut extractor = self.extractor_factory.open(source)?;
        let count = extractor.count_tracks();
        info!("{} 📦 {} 共 {} 条轨道", log_ctx(), source.description(), count);

        let mut audio: Option<Box<dyn MediaTrack>> = None;
        let mut video: Option<Box<dyn MediaTrack>> = None;

        for index in 0..count {
            let Some(format) = extractor.track_format(index) else {
                continue;
            };
            let slot = match format.kind() {
                TrackKind::Video if video.is_none() => &mut video,
                TrackKind::Audio if audio.is_none() => &mut audio,
                _ => continue,
            };
            match extractor.get_track(index) {
                Ok(track) => {
                    info!("{} 🎞 挂接轨道 {}: {}", log_ctx(), index, format.mime);
                    *slot = Some(track);
                }
                Err(e) => warn!("{} ⚠️ 轨道 {} ({}) 挂接失败: {}", log_ctx(), index, format.mime, e),
            }
        }

        let prefetcher: Option<Arc<dyn Prefetcher>> = extractor.wants_prefetching().then(|| {
            Arc::new(ReadAheadPrefetcher::new(
                self.config.prefetch.clone(),
                Duration::from_millis(self.config.teardown_timeout_ms),
                Duration::from_micros(self.config.teardown_poll_interval_us as u64),
            )) as Arc<dyn Prefetcher>
        });
        if let Some(prefetcher) = &prefetcher {
            audio = audio.map(|track| prefetcher.add_source(track));
            video = video.map(|track| prefetcher.add_source(track));
        }

        if let Some(mut track) = video.take() {
            match track.start() {
                Ok(()) => video = Some(track),
                Err(e) => warn!("{} ⚠️ 视频轨道启动失败: {}", log_ctx(), e),
            }
        }

        if audio.is_none() && video.is_none() {
            return Err(PlayerError::Unknown("没有可用的音视频轨道".to_string()));
        }

        if let Some(prefetcher) = &prefetcher {
            prefetcher.prepare();
        }

        Ok(AttachedTracks {
            audio,
            video,
            prefetcher,
        })
    }

    fn install_tracks_l(&self, st: &mut ManagerState, tracks: AttachedTracks) {
        let formats = [
            tracks.audio.as_ref().map(|track| track.format()),
            tracks.video.as_ref().map(|track| track.format()),
        ];
        st.duration_us = formats
            .iter()
            .flatten()
            .filter_map(|format| format.duration_us)
            .max()
            .unwrap_or(-1);

        if let Some(format) = &formats[1] {
            st.video_width = format.width.unwrap_or(-1);
            st.video_height = format.height.unwrap_or(-1);
            st.video_format = Some(format.clone());
        }

        st.audio_track = tracks.audio;
        st.video_track = tracks.video;
        st.prefetcher = tracks.prefetcher;
    }

    fn finish_prepare_l(&self, st: &mut ManagerState, result: Result<()>) {
        match &result {
            Ok(()) => {
                info!(
                    "{} ✅ 准备完成: 时长 {} ms, 画面 {}x{}",
                    log_ctx(),
                    st.duration_us / 1000,
                    st.video_width,
                    st.video_height
                );
                st.flags.insert(PlayerFlags::PREPARED);
                if st.is_async_prepare {
                    let (width, height) = if st.video_width < 0 || st.video_height < 0 {
                        (0, 0)
                    } else {
                        (st.video_width, st.video_height)
                    };
                    st.notify(MediaEvent::VideoSizeChanged { width, height });
                    st.notify(MediaEvent::Prepared);
                }
            }
            Err(e) => {
                error!("{} ❌ 准备失败: {}", log_ctx(), e);
                if st.is_async_prepare {
                    st.notify(MediaEvent::Error {
                        kind: ErrorKind::Unknown,
                        code: e.code(),
                    });
                }
            }
        }

        st.prepare_result = Some(result);
        st.flags.remove(PlayerFlags::PREPARING);
        st.is_async_prepare = false;
        self.prepared.notify_all();

        if st.flags.contains(PlayerFlags::PREPARED) {
            self.post_buffering_l(st);
        }
    }
}
