use crate::core::{PlayerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 播放器配置
///
/// 所有字段都有默认值，JSON 里只需写要覆盖的项。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// 视频事件默认节拍（微秒）
    pub video_tick_interval_us: i64,
    /// 迟到超过该值的帧直接丢弃
    pub late_frame_threshold_us: i64,
    /// 早到超过该值的帧延后再试
    pub early_frame_threshold_us: i64,
    /// 缓冲进度通知周期
    pub buffering_interval_us: i64,
    /// 音频状态轮询周期
    pub audio_status_interval_us: i64,
    /// 关闭视频管线时的轮询间隔
    pub teardown_poll_interval_us: i64,
    /// 关闭视频管线的最长等待
    pub teardown_timeout_ms: u64,
    /// 使用远端渲染器的解码组件名前缀
    pub remote_component_prefix: String,
    /// 注册表里优先使用的加速渲染器
    pub accelerated_renderer: Option<String>,
    pub prefetch: PrefetchConfig,
    pub audio: AudioConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            video_tick_interval_us: 10_000,
            late_frame_threshold_us: 40_000,
            early_frame_threshold_us: 10_000,
            buffering_interval_us: 1_000_000,
            audio_status_interval_us: 100_000,
            teardown_poll_interval_us: 1_000,
            teardown_timeout_ms: 5_000,
            remote_component_prefix: "hw.".to_string(),
            accelerated_renderer: None,
            prefetch: PrefetchConfig::default(),
            audio: AudioConfig::default(),
        }
    }
}

/// 预取配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// 每条轨道最多缓存的缓冲区数量（背压）
    pub max_buffers_per_track: usize,
    /// prepare 阶段的目标缓存时长
    pub target_cached_us: i64,
    /// prepare 最长等待
    pub prepare_timeout_ms: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            max_buffers_per_track: 64,
            target_cached_us: 2_000_000,
            prepare_timeout_ms: 8_000,
        }
    }
}

/// 音频输出配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// 输出设备中排队的最大时长（毫秒）
    pub max_queued_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self { max_queued_ms: 500 }
    }
}

impl PlayerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PlayerConfig =
            serde_json::from_str(json).map_err(|e| PlayerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PlayerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let cadences = [
            ("video_tick_interval_us", self.video_tick_interval_us),
            ("buffering_interval_us", self.buffering_interval_us),
            ("audio_status_interval_us", self.audio_status_interval_us),
            ("teardown_poll_interval_us", self.teardown_poll_interval_us),
            ("late_frame_threshold_us", self.late_frame_threshold_us),
            ("early_frame_threshold_us", self.early_frame_threshold_us),
        ];
        for (name, value) in cadences {
            if value <= 0 {
                return Err(PlayerError::Config(format!("{} 必须为正数 (当前 {})", name, value)));
            }
        }
        if self.prefetch.max_buffers_per_track == 0 {
            return Err(PlayerError::Config("prefetch.max_buffers_per_track 不能为 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PlayerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.late_frame_threshold_us, 40_000);
        assert_eq!(config.early_frame_threshold_us, 10_000);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = PlayerConfig::from_json_str(
            r#"{ "buffering_interval_us": 500000, "prefetch": { "target_cached_us": 1000 } }"#,
        )
        .unwrap();
        assert_eq!(config.buffering_interval_us, 500_000);
        assert_eq!(config.prefetch.target_cached_us, 1000);
        assert_eq!(config.prefetch.max_buffers_per_track, 64);
        assert_eq!(config.video_tick_interval_us, 10_000);
    }

    #[test]
    fn test_rejects_zero_cadence() {
        let err = PlayerConfig::from_json_str(r#"{ "video_tick_interval_us": 0 }"#).unwrap_err();
        assert!(matches!(err, PlayerError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("player.json");
        std::fs::write(&path, r#"{ "remote_component_prefix": "omx." }"#).unwrap();
        let config = PlayerConfig::load(&path).unwrap();
        assert_eq!(config.remote_component_prefix, "omx.");
    }
}
