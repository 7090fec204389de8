//! 播放编排核心
//!
//! 一个事件队列线程驱动视频节拍、流结束、缓冲进度和音频状态轮询，
//! 音频播放器激活后充当主时钟。解封装、解码、音频输出和显示都在 trait 之后，
//! 默认不依赖任何多媒体库；`ffmpeg` 和 `cpal-output` 特性提供真实后端。

pub mod core;
pub mod player;
pub mod renderer;

pub use crate::core::{PlaybackState, PlayerConfig, PlayerError, PlayerFlags, PlayerStatus, Result};
pub use crate::player::{DataSource, MediaEvent, PlaybackManager, PlayerListener};
