// 视频渲染模块

pub mod color;
pub mod remote;
pub mod software;

pub use remote::{RemoteRenderService, RemoteRenderTarget, RemoteRenderer};
pub use software::SoftwareRenderer;

use crate::core::{MediaBuffer, PixelFormat, PlayerConfig, VideoFrame};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 显示表面：最终的 RGBA 帧投递到这里
pub trait VideoSurface: Send + Sync {
    fn post_frame(&self, frame: VideoFrame);
}

/// 渲染能力：只借用缓冲区，不取得所有权
pub trait VideoRenderer: Send {
    fn render(&mut self, buffer: &MediaBuffer);

    /// 仅用于绘制挂起快照的预览渲染器
    fn is_preview_only(&self) -> bool {
        false
    }
}

/// 本地渲染后端：直接处理一帧原始像素
pub trait FrameRenderer: Send {
    fn render_raw(&mut self, data: &[u8], pts_us: i64);
}

/// 渲染器构造参数
#[derive(Clone)]
pub struct RendererParams {
    pub preview_only: bool,
    pub component: String,
    pub color_format: PixelFormat,
    pub surface: Arc<dyn VideoSurface>,
    pub display_width: i32,
    pub display_height: i32,
    pub decoded_width: i32,
    pub decoded_height: i32,
}

impl fmt::Debug for RendererParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendererParams")
            .field("preview_only", &self.preview_only)
            .field("component", &self.component)
            .field("color_format", &self.color_format)
            .field("display", &(self.display_width, self.display_height))
            .field("decoded", &(self.decoded_width, self.decoded_height))
            .finish()
    }
}

/// 加速渲染后端工厂；返回 None 表示当前参数不支持
pub type FrameRendererFactory =
    Arc<dyn Fn(&RendererParams) -> Option<Box<dyn FrameRenderer>> + Send + Sync>;

/// 启动时注册的本地渲染后端
///
/// 软件渲染器不需要注册，总是作为兜底。
#[derive(Clone, Default)]
pub struct RendererRegistry {
    factories: HashMap<String, FrameRendererFactory>,
}

impl RendererRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: FrameRendererFactory) {
        let name = name.into();
        info!("🎨 注册加速渲染后端: {}", name);
        self.factories.insert(name, factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// 按名字选加速后端，失败则退回软件渲染
    pub fn create_local(&self, params: &RendererParams, preferred: Option<&str>) -> LocalRenderer {
        if !params.preview_only {
            if let Some(name) = preferred {
                match self.factories.get(name).and_then(|factory| factory(params)) {
                    Some(target) => {
                        info!("🎨 使用加速渲染后端: {}", name);
                        return LocalRenderer::new(target, false);
                    }
                    None => warn!("加速渲染后端 {} 不可用，使用软件渲染", name),
                }
            }
        }
        LocalRenderer::new(Box::new(SoftwareRenderer::new(params)), params.preview_only)
    }
}

/// 进程内渲染器：把缓冲区数据交给本地后端
pub struct LocalRenderer {
    target: Box<dyn FrameRenderer>,
    preview_only: bool,
}

impl LocalRenderer {
    pub fn new(target: Box<dyn FrameRenderer>, preview_only: bool) -> Self {
        Self { target, preview_only }
    }

    /// 直接绘制一帧原始像素（挂起快照预览）
    pub fn render_raw(&mut self, data: &[u8], pts_us: i64) {
        self.target.render_raw(data, pts_us);
    }
}

impl VideoRenderer for LocalRenderer {
    fn render(&mut self, buffer: &MediaBuffer) {
        self.target.render_raw(buffer.data(), buffer.timestamp_us());
    }

    fn is_preview_only(&self) -> bool {
        self.preview_only
    }
}

/// 按解码器组件名选择渲染器，只在构造时决定一次
///
/// 组件名带远端前缀且远端服务可用时走远端渲染，否则走本地渲染。
pub fn create_renderer(
    params: &RendererParams,
    config: &PlayerConfig,
    registry: &RendererRegistry,
    remote: Option<&Arc<dyn RemoteRenderService>>,
) -> Box<dyn VideoRenderer> {
    if !params.preview_only && params.component.starts_with(&config.remote_component_prefix) {
        match remote {
            Some(service) => match service.create_target(params) {
                Ok(target) => {
                    info!("🎨 远端渲染: {}", params.component);
                    return Box::new(RemoteRenderer::new(target));
                }
                Err(e) => warn!("创建远端渲染目标失败，退回本地渲染: {}", e),
            },
            None => debug!("未设置远端渲染服务，{} 使用本地渲染", params.component),
        }
    }
    Box::new(registry.create_local(params, config.accelerated_renderer.as_deref()))
}
