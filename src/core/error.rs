use thiserror::Error;

/// 播放器错误
///
/// 需要 `Clone`：prepare 的结果和 stream-done 的状态码都要在锁内保存，
/// 之后再交给等待方或监听器。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlayerError {
    #[error("无法打开数据源: {0}")]
    UnknownSource(String),

    #[error("无法识别的容器格式: {0}")]
    UnknownFormat(String),

    #[error("轨道挂载失败: {0}")]
    TrackAttach(String),

    #[error("正在准备中")]
    Busy,

    #[error("状态错误: {0}")]
    InvalidState(String),

    #[error("解码错误: {0}")]
    Decode(String),

    #[error("到达流末尾")]
    EndOfStream,

    /// 解码输出格式变化（非致命，调用方应重新读取）
    #[error("输出格式已变化")]
    FormatChanged,

    #[error("致命错误: {0}")]
    Fatal(String),

    #[error("音频输出错误: {0}")]
    Audio(String),

    #[error("渲染错误: {0}")]
    Render(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("未知错误: {0}")]
    Unknown(String),
}

impl PlayerError {
    /// 稳定的数值错误码，用于 `MediaEvent::Error { code }`
    pub fn code(&self) -> i32 {
        match self {
            PlayerError::UnknownSource(_) => -1001,
            PlayerError::UnknownFormat(_) => -1002,
            PlayerError::TrackAttach(_) => -1003,
            PlayerError::Busy => -1004,
            PlayerError::InvalidState(_) => -1005,
            PlayerError::Decode(_) => -1006,
            PlayerError::EndOfStream => -1007,
            PlayerError::FormatChanged => -1008,
            PlayerError::Fatal(_) => -1009,
            PlayerError::Audio(_) => -1010,
            PlayerError::Render(_) => -1011,
            PlayerError::Config(_) => -1012,
            PlayerError::Unknown(_) => -1013,
        }
    }

    /// 是否为正常的流结束信号
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, PlayerError::EndOfStream)
    }
}

impl From<std::io::Error> for PlayerError {
    fn from(e: std::io::Error) -> Self {
        PlayerError::UnknownSource(e.to_string())
    }
}

#[cfg(feature = "ffmpeg")]
impl From<ffmpeg_next::Error> for PlayerError {
    fn from(e: ffmpeg_next::Error) -> Self {
        match e {
            ffmpeg_next::Error::Eof => PlayerError::EndOfStream,
            other => PlayerError::Decode(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
