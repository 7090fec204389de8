use super::{color, FrameRenderer, RendererParams, VideoSurface};
use crate::core::{PixelFormat, VideoFrame};
use log::{debug, warn};
use std::sync::Arc;

#[derive(Default)]
struct RenderStats {
    frames_rendered: u64,
    frames_rejected: u64,
}

/// 软件渲染器：颜色转换为 RGBA 后投递到显示表面
pub struct SoftwareRenderer {
    surface: Arc<dyn VideoSurface>,
    color_format: PixelFormat,
    display_width: usize,
    display_height: usize,
    decoded_width: usize,
    decoded_height: usize,
    stats: RenderStats,
}

impl SoftwareRenderer {
    pub fn new(params: &RendererParams) -> Self {
        debug!(
            "🎨 软件渲染器: {:?} 解码 {}x{} 显示 {}x{}",
            params.color_format,
            params.decoded_width,
            params.decoded_height,
            params.display_width,
            params.display_height
        );
        Self {
            surface: params.surface.clone(),
            color_format: params.color_format,
            display_width: params.display_width.max(0) as usize,
            display_height: params.display_height.max(0) as usize,
            decoded_width: params.decoded_width.max(0) as usize,
            decoded_height: params.decoded_height.max(0) as usize,
            stats: RenderStats::default(),
        }
    }

    pub fn frames_rendered(&self) -> u64 {
        self.stats.frames_rendered
    }
}

impl FrameRenderer for SoftwareRenderer {
    fn render_raw(&mut self, data: &[u8], pts_us: i64) {
        let Some(rgba) = color::to_rgba(
            self.color_format,
            data,
            self.decoded_width,
            self.decoded_height,
            self.display_width,
            self.display_height,
        ) else {
            self.stats.frames_rejected += 1;
            warn!(
                "⚠️ 帧数据不足: {} 字节, 需要 {:?} {}x{} (累计丢弃 {})",
                data.len(),
                self.color_format,
                self.decoded_width,
                self.decoded_height,
                self.stats.frames_rejected
            );
            return;
        };

        self.surface.post_frame(VideoFrame {
            pts_us,
            width: self.display_width.min(self.decoded_width) as u32,
            height: self.display_height.min(self.decoded_height) as u32,
            format: PixelFormat::RGBA,
            data: rgba,
        });
        self.stats.frames_rendered += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::test_support::RecordingSurface;

    #[test]
    fn test_converts_and_crops() {
        let surface = Arc::new(RecordingSurface::new());
        let mut renderer = SoftwareRenderer::new(&RendererParams {
            preview_only: true,
            component: String::new(),
            color_format: PixelFormat::RGB,
            surface: surface.clone(),
            display_width: 1,
            display_height: 1,
            decoded_width: 2,
            decoded_height: 1,
        });
        renderer.render_raw(&[10, 20, 30, 40, 50, 60], 5);
        assert_eq!(renderer.frames_rendered(), 1);

        let frames = surface.frames();
        assert_eq!(frames[0].width, 1);
        assert_eq!(frames[0].data, vec![10, 20, 30, 255]);
    }

    #[test]
    fn test_short_frame_is_skipped() {
        let surface = Arc::new(RecordingSurface::new());
        let mut renderer = SoftwareRenderer::new(&RendererParams {
            preview_only: false,
            component: String::new(),
            color_format: PixelFormat::YUV420P,
            surface: surface.clone(),
            display_width: 4,
            display_height: 4,
            decoded_width: 4,
            decoded_height: 4,
        });
        renderer.render_raw(&[0; 10], 0);
        assert_eq!(renderer.frames_rendered(), 0);
        assert_eq!(surface.frame_count(), 0);
    }
}
