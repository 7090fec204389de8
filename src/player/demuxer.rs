use crate::core::{PixelFormat, PlayerError, Result, StreamProtocol, TrackFormat};
use crate::player::decoder::FfmpegTrack;
use crate::player::source::{DataSource, ExtractorFactory, MediaExtractor};
use crate::player::track::MediaTrack;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, media};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// 单条流最多积压的数据包，超出后丢弃最旧的
const MAX_QUEUED_PACKETS: usize = 2048;

struct DemuxState {
    input: format::context::Input,
    /// 只为已启动的轨道排队
    queues: HashMap<usize, VecDeque<ffmpeg::Packet>>,
    eof: bool,
}

// Input 内部是裸指针；所有访问都经过 SharedDemuxer 的锁
unsafe impl Send for DemuxState {}

/// 多条轨道共用的解封装上下文
///
/// 哪条轨道读到别的流的包，就替它排进对应队列。
pub struct SharedDemuxer {
    state: Mutex<DemuxState>,
    description: String,
}

impl SharedDemuxer {
    fn new(input: format::context::Input, description: String) -> Self {
        Self {
            state: Mutex::new(DemuxState {
                input,
                queues: HashMap::new(),
                eof: false,
            }),
            description,
        }
    }

    pub fn activate(&self, stream_index: usize) {
        self.state.lock().queues.entry(stream_index).or_default();
    }

    pub fn deactivate(&self, stream_index: usize) {
        self.state.lock().queues.remove(&stream_index);
    }

    /// 取下一个属于 `stream_index` 的包，`None` 表示读到文件末尾
    pub fn next_packet(&self, stream_index: usize) -> Result<Option<ffmpeg::Packet>> {
        let mut st = self.state.lock();
        loop {
            if let Some(packet) = st.queues.get_mut(&stream_index).and_then(|queue| queue.pop_front()) {
                return Ok(Some(packet));
            }
            if st.eof {
                return Ok(None);
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut st.input) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => {
                    debug!("📦 {} 读到末尾", self.description);
                    st.eof = true;
                    continue;
                }
                Err(e) => return Err(PlayerError::Decode(format!("读取数据包失败: {}", e))),
            }

            if let Some(queue) = st.queues.get_mut(&packet.stream()) {
                if queue.len() >= MAX_QUEUED_PACKETS {
                    warn!("⚠️ 流 {} 积压过多，丢弃最旧的数据包", packet.stream());
                    queue.pop_front();
                }
                queue.push_back(packet);
            }
        }
    }

    /// 整个输入一起 seek，所有轨道的积压都作废
    pub fn seek(&self, time_us: i64) -> Result<()> {
        let mut st = self.state.lock();
        st.input
            .seek(time_us, ..time_us)
            .map_err(|e| PlayerError::Decode(format!("seek 到 {} ms 失败: {}", time_us / 1000, e)))?;
        for queue in st.queues.values_mut() {
            queue.clear();
        }
        st.eof = false;
        Ok(())
    }

    pub(crate) fn with_stream<T>(
        &self,
        index: usize,
        f: impl FnOnce(&format::stream::Stream) -> Result<T>,
    ) -> Result<T> {
        let st = self.state.lock();
        let stream = st
            .input
            .stream(index)
            .ok_or_else(|| PlayerError::TrackAttach(format!("轨道 {} 不存在", index)))?;
        f(&stream)
    }
}

/// FFmpeg 解封装器
pub struct FfmpegExtractor {
    demuxer: Arc<SharedDemuxer>,
    formats: Vec<TrackFormat>,
    network: bool,
}

impl FfmpegExtractor {
    fn probe_format(stream: &format::stream::Stream, duration_us: Option<i64>) -> TrackFormat {
        let parameters = stream.parameters();
        let codec_name = parameters.id().name().to_string();
        let medium = parameters.medium();

        let mut format = match medium {
            media::Type::Video => TrackFormat::new(format!("video/{}", codec_name)),
            media::Type::Audio => TrackFormat::new(format!("audio/{}", codec_name)),
            _ => TrackFormat::new(format!("application/{}", codec_name)),
        };
        if let Some(duration_us) = duration_us {
            format = format.with_duration_us(duration_us);
        }

        let context = match codec::context::Context::from_parameters(parameters) {
            Ok(context) => context,
            Err(e) => {
                warn!("⚠️ 读取流 {} 的编码参数失败: {}", stream.index(), e);
                return format;
            }
        };

        match medium {
            media::Type::Video => match context.decoder().video() {
                Ok(decoder) => format
                    .with_size(decoder.width() as i32, decoder.height() as i32)
                    .with_color_format(PixelFormat::RGBA)
                    .with_decoder_component(format!("ffmpeg.{}", codec_name)),
                Err(e) => {
                    warn!("⚠️ 视频流 {} 无法创建解码器: {}", stream.index(), e);
                    format
                }
            },
            media::Type::Audio => match context.decoder().audio() {
                // 输出固定为交错 f32，最多两声道
                Ok(decoder) => format.with_audio(decoder.rate(), decoder.channels().clamp(1, 2)),
                Err(e) => {
                    warn!("⚠️ 音频流 {} 无法创建解码器: {}", stream.index(), e);
                    format
                }
            },
            _ => format,
        }
    }
}

impl MediaExtractor for FfmpegExtractor {
    fn count_tracks(&self) -> usize {
        self.formats.len()
    }

    fn track_format(&self, index: usize) -> Option<TrackFormat> {
        self.formats.get(index).cloned()
    }

    fn get_track(&mut self, index: usize) -> Result<Box<dyn MediaTrack>> {
        let format = self
            .formats
            .get(index)
            .cloned()
            .ok_or_else(|| PlayerError::TrackAttach(format!("轨道 {} 不存在", index)))?;
        let track = FfmpegTrack::new(self.demuxer.clone(), index, format)?;
        Ok(Box::new(track))
    }

    fn wants_prefetching(&self) -> bool {
        self.network
    }
}

/// 基于 FFmpeg 的解封装器工厂
pub struct FfmpegExtractorFactory {
    _private: (),
}

impl FfmpegExtractorFactory {
    pub fn new() -> Result<Self> {
        ffmpeg::init().map_err(|e| PlayerError::Unknown(format!("FFmpeg 初始化失败: {}", e)))?;
        info!("✅ FFmpeg 初始化成功");
        Ok(Self { _private: () })
    }

    /// 网络流选项：丢弃损坏帧、超时与重连
    fn network_options(uri: &str, headers: &HashMap<String, String>) -> ffmpeg::Dictionary<'static> {
        let mut options = ffmpeg::Dictionary::new();
        options.set("fflags", "+discardcorrupt+genpts");
        options.set("analyzeduration", "5000000");
        options.set("probesize", "10000000");
        options.set("timeout", "15000000");
        options.set("rw_timeout", "8000000");
        options.set("reconnect", "1");
        options.set("reconnect_streamed", "1");
        options.set("reconnect_delay_max", "4");

        if StreamProtocol::from_locator(uri) == Some(StreamProtocol::HLS) {
            options.set("http_persistent", "1");
            options.set("max_reload", "10");
        }

        if !headers.is_empty() {
            let joined: String = headers
                .iter()
                .map(|(key, value)| format!("{}: {}\r\n", key, value))
                .collect();
            options.set("headers", &joined);
        }
        options
    }

    fn open_input(source: &DataSource) -> Result<(format::context::Input, bool)> {
        match source {
            DataSource::Uri { uri, headers } => {
                let protocol = source.protocol();
                let network = protocol.is_some();
                let input = if let Some(protocol) = protocol {
                    info!("🌐 检测到 {} 网络流: {}", protocol.as_str(), uri);
                    format::input_with_dictionary(uri, Self::network_options(uri, headers))
                } else {
                    format::input(uri)
                };
                let input = input.map_err(|e| PlayerError::UnknownSource(format!("{}: {}", uri, e)))?;
                Ok((input, network))
            }
            #[cfg(unix)]
            DataSource::File(file) => {
                use std::os::unix::io::AsRawFd;
                let path = format!("/proc/self/fd/{}", file.file().as_raw_fd());
                let mut options = ffmpeg::Dictionary::new();
                if file.offset() > 0 {
                    options.set("skip_initial_bytes", &file.offset().to_string());
                }
                let input = format::input_with_dictionary(&path, options)
                    .map_err(|e| PlayerError::UnknownSource(format!("{}: {}", source.description(), e)))?;
                Ok((input, false))
            }
            #[cfg(not(unix))]
            DataSource::File(_) => Err(PlayerError::UnknownSource(
                "当前平台不支持文件句柄数据源".to_string(),
            )),
        }
    }
}

impl ExtractorFactory for FfmpegExtractorFactory {
    fn open(&self, source: &DataSource) -> Result<Box<dyn MediaExtractor>> {
        let (input, network) = Self::open_input(source)?;

        let duration_us = (input.duration() > 0).then(|| input.duration());
        let formats: Vec<TrackFormat> = input
            .streams()
            .map(|stream| FfmpegExtractor::probe_format(&stream, duration_us))
            .collect();

        if !formats.iter().any(|format| format.mime.starts_with("video/") || format.mime.starts_with("audio/")) {
            return Err(PlayerError::UnknownFormat(format!("{} 中没有音视频流", source.description())));
        }

        for (index, format) in formats.iter().enumerate() {
            debug!("📦 流 {}: {:?}", index, format);
        }

        Ok(Box::new(FfmpegExtractor {
            demuxer: Arc::new(SharedDemuxer::new(input, source.description())),
            formats,
            network,
        }))
    }
}
