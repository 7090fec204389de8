use super::{RendererParams, VideoRenderer};
use crate::core::{MediaBuffer, Result};
use log::trace;

/// 远端渲染目标：按解码器缓冲区 ID 显示，数据不经过本进程
pub trait RemoteRenderTarget: Send {
    fn render(&mut self, buffer_id: u64);
}

/// 远端渲染服务（硬件解码器配套的合成器）
pub trait RemoteRenderService: Send + Sync {
    fn create_target(&self, params: &RendererParams) -> Result<Box<dyn RemoteRenderTarget>>;
}

pub struct RemoteRenderer {
    target: Box<dyn RemoteRenderTarget>,
}

impl RemoteRenderer {
    pub fn new(target: Box<dyn RemoteRenderTarget>) -> Self {
        Self { target }
    }
}

impl VideoRenderer for RemoteRenderer {
    fn render(&mut self, buffer: &MediaBuffer) {
        match buffer.buffer_id() {
            Some(id) => self.target.render(id),
            None => trace!("缓冲区没有解码器 ID，跳过远端渲染 (pts={})", buffer.timestamp_us()),
        }
    }
}
