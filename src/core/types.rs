use serde::{Deserialize, Serialize};
use std::fmt;

/// 流媒体协议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamProtocol {
    /// RTSP - 实时流协议（监控摄像头）
    RTSP,
    /// RTMP - 实时消息协议（直播流）
    RTMP,
    /// HLS - HTTP Live Streaming
    HLS,
    /// HTTP - 普通 HTTP 流
    HTTP,
}

impl StreamProtocol {
    /// 从定位符解析网络协议，本地路径返回 None
    pub fn from_locator(locator: &str) -> Option<Self> {
        let lower = locator.to_ascii_lowercase();
        if lower.starts_with("rtsp://") {
            Some(StreamProtocol::RTSP)
        } else if lower.starts_with("rtmp://") {
            Some(StreamProtocol::RTMP)
        } else if lower.ends_with(".m3u8") || lower.contains("/hls/") {
            Some(StreamProtocol::HLS)
        } else if lower.starts_with("http://") || lower.starts_with("https://") {
            Some(StreamProtocol::HTTP)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamProtocol::RTSP => "RTSP",
            StreamProtocol::RTMP => "RTMP",
            StreamProtocol::HLS => "HLS",
            StreamProtocol::HTTP => "HTTP",
        }
    }
}

/// 像素格式（解码输出的颜色格式）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    RGBA,
    RGB,
    YUV420P,
    NV12,
}

impl PixelFormat {
    /// 一帧 `width x height` 图像所需的字节数
    pub fn frame_size(&self, width: usize, height: usize) -> usize {
        match self {
            PixelFormat::RGBA => width * height * 4,
            PixelFormat::RGB => width * height * 3,
            PixelFormat::YUV420P | PixelFormat::NV12 => {
                width * height + 2 * (width.div_ceil(2) * height.div_ceil(2))
            }
        }
    }
}

/// 交给显示表面的视频帧（总是 RGBA）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoFrame {
    pub pts_us: i64,        // 显示时间戳（微秒）
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,      // CPU 内存数据
}

/// 轨道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Audio,
    Video,
    Other,
}

/// 轨道格式元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackFormat {
    pub mime: String,
    pub duration_us: Option<i64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub color_format: Option<PixelFormat>,
    pub decoder_component: Option<String>,
    pub sample_rate: Option<u32>,
    pub channel_count: Option<u16>,
}

impl TrackFormat {
    pub fn new(mime: impl Into<String>) -> Self {
        Self {
            mime: mime.into(),
            ..Default::default()
        }
    }

    /// 按 mime 前缀（不区分大小写）判断轨道类型
    pub fn kind(&self) -> TrackKind {
        let mime = self.mime.as_bytes();
        let has_prefix = |prefix: &str| {
            mime.len() >= prefix.len() && mime[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
        };
        if has_prefix("video/") {
            TrackKind::Video
        } else if has_prefix("audio/") {
            TrackKind::Audio
        } else {
            TrackKind::Other
        }
    }

    pub fn with_duration_us(mut self, duration_us: i64) -> Self {
        self.duration_us = Some(duration_us);
        self
    }

    pub fn with_size(mut self, width: i32, height: i32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_color_format(mut self, format: PixelFormat) -> Self {
        self.color_format = Some(format);
        self
    }

    pub fn with_decoder_component(mut self, component: impl Into<String>) -> Self {
        self.decoder_component = Some(component.into());
        self
    }

    pub fn with_audio(mut self, sample_rate: u32, channel_count: u16) -> Self {
        self.sample_rate = Some(sample_rate);
        self.channel_count = Some(channel_count);
        self
    }
}

/// 读取选项：可选的 seek 指令
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub seek_to_us: Option<i64>,
}

impl ReadOptions {
    pub fn seek_to(time_us: i64) -> Self {
        Self {
            seek_to_us: Some(time_us),
        }
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// 解码后的媒体缓冲区
///
/// 所有权从轨道转移给读取方，每次获取恰好释放一次：显式调用
/// [`MediaBuffer::release`] 或直接 drop，两条路径都会触发释放回调。
pub struct MediaBuffer {
    data: Vec<u8>,
    offset: usize,
    length: usize,
    timestamp_us: i64,
    buffer_id: Option<u64>,
    on_release: Option<ReleaseHook>,
}

impl MediaBuffer {
    pub fn new(data: Vec<u8>, timestamp_us: i64) -> Self {
        let length = data.len();
        Self {
            data,
            offset: 0,
            length,
            timestamp_us,
            buffer_id: None,
            on_release: None,
        }
    }

    /// 只暴露 `[offset, offset + length)` 区间
    pub fn with_range(mut self, offset: usize, length: usize) -> Self {
        let offset = offset.min(self.data.len());
        self.offset = offset;
        self.length = length.min(self.data.len() - offset);
        self
    }

    /// 解码器侧的缓冲区 ID（远端渲染使用）
    pub fn with_buffer_id(mut self, id: u64) -> Self {
        self.buffer_id = Some(id);
        self
    }

    /// 释放时回调（归还缓冲池等）
    pub fn with_release_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.length]
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn timestamp_us(&self) -> i64 {
        self.timestamp_us
    }

    pub fn buffer_id(&self) -> Option<u64> {
        self.buffer_id
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for MediaBuffer {
    fn drop(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

impl fmt::Debug for MediaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaBuffer")
            .field("len", &self.length)
            .field("timestamp_us", &self.timestamp_us)
            .field("buffer_id", &self.buffer_id)
            .finish()
    }
}

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    SourceSet,
    Preparing,
    Prepared,
    Playing,
    Paused,
    Ended,
    Error,
    Suspended,
}

/// 播放器状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerStatus {
    pub state: PlaybackState,
    pub position_us: i64,           // 当前位置（微秒）
    pub duration_us: Option<i64>,   // 总时长（微秒）
    pub video_size: Option<(i32, i32)>,
    pub looping: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_protocol_from_locator() {
        assert_eq!(StreamProtocol::from_locator("rtsp://cam/1"), Some(StreamProtocol::RTSP));
        assert_eq!(StreamProtocol::from_locator("https://a/b/index.m3u8"), Some(StreamProtocol::HLS));
        assert_eq!(StreamProtocol::from_locator("HTTP://a/b.mp4"), Some(StreamProtocol::HTTP));
        assert_eq!(StreamProtocol::from_locator("/sdcard/movie.mp4"), None);
    }

    #[test]
    fn test_track_kind_by_mime_prefix() {
        assert_eq!(TrackFormat::new("video/avc").kind(), TrackKind::Video);
        assert_eq!(TrackFormat::new("Audio/MP4A-LATM").kind(), TrackKind::Audio);
        assert_eq!(TrackFormat::new("text/3gpp").kind(), TrackKind::Other);
        assert_eq!(TrackFormat::new("vid").kind(), TrackKind::Other);
    }

    #[test]
    fn test_buffer_released_exactly_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let buffer = MediaBuffer::new(vec![1, 2, 3, 4], 42).with_release_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(buffer.len(), 4);
        buffer.release();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_buffer_range() {
        let buffer = MediaBuffer::new(vec![0, 1, 2, 3, 4, 5], 0).with_range(2, 10);
        assert_eq!(buffer.data(), &[2, 3, 4, 5]);
        let empty = MediaBuffer::new(vec![9; 8], 0).with_range(8, 4);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(PixelFormat::RGBA.frame_size(2, 2), 16);
        assert_eq!(PixelFormat::YUV420P.frame_size(4, 2), 8 + 4);
        assert_eq!(PixelFormat::NV12.frame_size(3, 3), 9 + 8);
    }
}
