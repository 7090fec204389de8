use crate::core::{MediaBuffer, PlayerError, ReadOptions, Result, TrackFormat, TrackKind};
use crate::player::demuxer::SharedDemuxer;
use crate::player::track::MediaTrack;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, software, util};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;

/// 视频解码 + 转 RGBA
struct VideoPath {
    decoder: codec::decoder::Video,
    scaler: Option<software::scaling::Context>,
    /// (像素格式, 宽, 高)，变化时重建 scaler
    scaler_key: Option<(util::format::Pixel, u32, u32)>,
}

/// 音频解码 + 重采样为交错 f32
struct AudioPath {
    decoder: codec::decoder::Audio,
    resampler: Option<software::resampling::Context>,
    channels: u16,
    sample_rate: u32,
}

enum CodecPath {
    Video(VideoPath),
    Audio(AudioPath),
}

/// FFmpeg 解码出的单条轨道
pub struct FfmpegTrack {
    demuxer: Arc<SharedDemuxer>,
    stream_index: usize,
    /// 每个时间戳刻度对应的微秒数
    time_base_us: f64,
    codec: CodecPath,
    format: TrackFormat,
    pending: VecDeque<MediaBuffer>,
    started: bool,
    draining: bool,
    last_pts_us: i64,
}

// SwsContext / SwrContext 不是 Send，但一条轨道同一时刻只被一个线程读取
unsafe impl Send for FfmpegTrack {}

impl FfmpegTrack {
    pub fn new(demuxer: Arc<SharedDemuxer>, stream_index: usize, format: TrackFormat) -> Result<Self> {
        let kind = format.kind();
        let (codec, time_base_us) = demuxer.with_stream(stream_index, |stream| {
            let time_base = stream.time_base();
            let time_base_us = time_base.numerator() as f64 * 1_000_000.0 / time_base.denominator().max(1) as f64;
            let context = codec::context::Context::from_parameters(stream.parameters())
                .map_err(|e| PlayerError::TrackAttach(format!("轨道 {}: {}", stream_index, e)))?;
            let codec = match kind {
                TrackKind::Video => CodecPath::Video(VideoPath {
                    decoder: context
                        .decoder()
                        .video()
                        .map_err(|e| PlayerError::TrackAttach(format!("视频解码器: {}", e)))?,
                    scaler: None,
                    scaler_key: None,
                }),
                TrackKind::Audio => CodecPath::Audio(AudioPath {
                    decoder: context
                        .decoder()
                        .audio()
                        .map_err(|e| PlayerError::TrackAttach(format!("音频解码器: {}", e)))?,
                    resampler: None,
                    channels: format.channel_count.unwrap_or(2),
                    sample_rate: format.sample_rate.unwrap_or(48_000),
                }),
                TrackKind::Other => {
                    return Err(PlayerError::TrackAttach(format!("不支持的轨道类型: {}", format.mime)));
                }
            };
            Ok((codec, time_base_us))
        })?;

        info!("🎞 创建解码轨道 {}: {}", stream_index, format.mime);
        Ok(Self {
            demuxer,
            stream_index,
            time_base_us,
            codec,
            format,
            pending: VecDeque::new(),
            started: false,
            draining: false,
            last_pts_us: 0,
        })
    }

    fn pts_us(&mut self, timestamp: Option<i64>) -> i64 {
        if let Some(ts) = timestamp {
            self.last_pts_us = (ts as f64 * self.time_base_us) as i64;
        }
        self.last_pts_us
    }

    fn send_packet(&mut self, packet: &ffmpeg::Packet) -> Result<()> {
        let result = match &mut self.codec {
            CodecPath::Video(path) => path.decoder.send_packet(packet),
            CodecPath::Audio(path) => path.decoder.send_packet(packet),
        };
        match result {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(ffmpeg::Error::InvalidData) => {
                // 网络流里偶发的坏包，跳过
                warn!("⚠️ 轨道 {} 跳过损坏的数据包", self.stream_index);
                Ok(())
            }
            Err(e) => Err(PlayerError::Decode(e.to_string())),
        }
    }

    fn send_eof(&mut self) {
        let result = match &mut self.codec {
            CodecPath::Video(path) => path.decoder.send_eof(),
            CodecPath::Audio(path) => path.decoder.send_eof(),
        };
        if let Err(e) = result {
            debug!("轨道 {} send_eof: {}", self.stream_index, e);
        }
    }

    fn flush_codec(&mut self) {
        match &mut self.codec {
            CodecPath::Video(path) => path.decoder.flush(),
            CodecPath::Audio(path) => path.decoder.flush(),
        }
    }

    /// EAGAIN / EOF 表示当前没有更多帧，其余错误向上传
    fn frame_ready(result: std::result::Result<(), ffmpeg::Error>) -> Result<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(ffmpeg::Error::Other { errno: 11 }) | Err(ffmpeg::Error::Eof) => Ok(false), // EAGAIN
            Err(e) => Err(PlayerError::Decode(format!("接收解码帧失败: {}", e))),
        }
    }

    /// 取出解码器里所有可用的帧，返回视频尺寸是否发生变化
    fn receive_frames(&mut self) -> Result<bool> {
        let mut size_changed = false;
        loop {
            let converted = match &mut self.codec {
                CodecPath::Video(path) => {
                    let mut frame = util::frame::Video::empty();
                    if Self::frame_ready(path.decoder.receive_frame(&mut frame))? {
                        let data = Self::convert_video(path, &frame)?;
                        Some((data, frame.timestamp(), Some((frame.width(), frame.height()))))
                    } else {
                        None
                    }
                }
                CodecPath::Audio(path) => {
                    let mut frame = util::frame::Audio::empty();
                    if Self::frame_ready(path.decoder.receive_frame(&mut frame))? {
                        let data = Self::convert_audio(path, &frame)?;
                        Some((data, frame.timestamp(), None))
                    } else {
                        None
                    }
                }
            };
            let Some((data, timestamp, size)) = converted else {
                return Ok(size_changed);
            };

            if let Some((width, height)) = size {
                let (width, height) = (width as i32, height as i32);
                if self.format.width != Some(width) || self.format.height != Some(height) {
                    info!("🔄 轨道 {} 分辨率变化: {}x{}", self.stream_index, width, height);
                    self.format = self.format.clone().with_size(width, height);
                    size_changed = true;
                }
            }

            let pts_us = self.pts_us(timestamp);
            self.pending.push_back(MediaBuffer::new(data, pts_us));
        }
    }

    fn convert_video(path: &mut VideoPath, frame: &util::frame::Video) -> Result<Vec<u8>> {
        let width = frame.width();
        let height = frame.height();
        let key = (frame.format(), width, height);

        if path.scaler_key != Some(key) {
            path.scaler = Some(
                software::scaling::Context::get(
                    frame.format(),
                    width,
                    height,
                    util::format::Pixel::RGBA,
                    width,
                    height,
                    software::scaling::Flags::BILINEAR,
                )
                .map_err(|e| PlayerError::Decode(format!("创建图像转换器失败: {}", e)))?,
            );
            path.scaler_key = Some(key);
        }
        let scaler = path
            .scaler
            .as_mut()
            .ok_or_else(|| PlayerError::Decode("图像转换器未初始化".to_string()))?;

        let mut rgba = util::frame::Video::empty();
        scaler
            .run(frame, &mut rgba)
            .map_err(|e| PlayerError::Decode(format!("图像转换失败: {}", e)))?;

        // 去掉行对齐填充
        let row_size = width as usize * 4;
        let stride = rgba.stride(0);
        let plane = rgba.data(0);
        let mut data = Vec::with_capacity(row_size * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            data.extend_from_slice(&plane[start..start + row_size]);
        }
        Ok(data)
    }

    fn convert_audio(path: &mut AudioPath, frame: &util::frame::Audio) -> Result<Vec<u8>> {
        if path.resampler.is_none() {
            let source_layout = if frame.channel_layout().is_empty() {
                util::channel_layout::ChannelLayout::default(frame.channels() as i32)
            } else {
                frame.channel_layout()
            };
            let target_layout = match path.channels {
                1 => util::channel_layout::ChannelLayout::MONO,
                _ => util::channel_layout::ChannelLayout::STEREO,
            };
            debug!(
                "🔧 初始化音频重采样器: {}Hz/{}ch → {}Hz/{}ch",
                frame.rate(),
                frame.channels(),
                path.sample_rate,
                path.channels
            );
            path.resampler = Some(
                software::resampling::Context::get(
                    frame.format(),
                    source_layout,
                    frame.rate(),
                    util::format::Sample::F32(util::format::sample::Type::Packed),
                    target_layout,
                    path.sample_rate,
                )
                .map_err(|e| PlayerError::Decode(format!("创建重采样器失败: {}", e)))?,
            );
        }
        let resampler = path
            .resampler
            .as_mut()
            .ok_or_else(|| PlayerError::Decode("重采样器未初始化".to_string()))?;

        let mut resampled = util::frame::Audio::empty();
        resampler
            .run(frame, &mut resampled)
            .map_err(|e| PlayerError::Decode(format!("重采样失败: {}", e)))?;

        let bytes = resampled.samples() * path.channels as usize * std::mem::size_of::<f32>();
        let plane = resampled.data(0);
        Ok(plane[..bytes.min(plane.len())].to_vec())
    }
}

impl MediaTrack for FfmpegTrack {
    fn start(&mut self) -> Result<()> {
        if !self.started {
            self.demuxer.activate(self.stream_index);
            self.started = true;
        }
        Ok(())
    }

    fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        self.pending.clear();
        self.flush_codec();
        self.demuxer.deactivate(self.stream_index);
        debug!("轨道 {} 已停止", self.stream_index);
    }

    fn format(&self) -> TrackFormat {
        self.format.clone()
    }

    fn read(&mut self, options: ReadOptions) -> Result<MediaBuffer> {
        if !self.started {
            return Err(PlayerError::InvalidState(format!("轨道 {} 未启动", self.stream_index)));
        }

        if let Some(time_us) = options.seek_to_us {
            self.demuxer.seek(time_us)?;
            self.flush_codec();
            self.pending.clear();
            self.draining = false;
            self.last_pts_us = time_us;
        }

        loop {
            if let Some(buffer) = self.pending.pop_front() {
                return Ok(buffer);
            }
            if self.draining {
                return Err(PlayerError::EndOfStream);
            }

            match self.demuxer.next_packet(self.stream_index)? {
                Some(packet) => self.send_packet(&packet)?,
                None => {
                    self.send_eof();
                    self.draining = true;
                }
            }

            if self.receive_frames()? {
                // 新尺寸的帧留在队首，调用方取到新格式后再读
                return Err(PlayerError::FormatChanged);
            }
        }
    }
}

impl Drop for FfmpegTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_ready_propagates_real_errors() {
        assert_eq!(FfmpegTrack::frame_ready(Ok(())), Ok(true));
        assert_eq!(FfmpegTrack::frame_ready(Err(ffmpeg::Error::Other { errno: 11 })), Ok(false));
        assert_eq!(FfmpegTrack::frame_ready(Err(ffmpeg::Error::Eof)), Ok(false));
        assert!(matches!(
            FfmpegTrack::frame_ready(Err(ffmpeg::Error::InvalidData)),
            Err(PlayerError::Decode(_))
        ));
    }
}
