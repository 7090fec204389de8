use crate::core::{MediaBuffer, ReadOptions, Result, TrackFormat};

/// 单条轨道的解码管线（拉模式）
///
/// `read` 的错误语义：
/// - `EndOfStream`：正常结束；
/// - `FormatChanged`：输出格式变了，调用方重新取 `format()` 后再读；
/// - 其他：解码失败，本条流终止。
pub trait MediaTrack: Send {
    fn start(&mut self) -> Result<()>;

    /// 停止管线；返回时底层解码已经完全静止
    fn stop(&mut self);

    /// 当前输出格式
    fn format(&self) -> TrackFormat;

    fn read(&mut self, options: ReadOptions) -> Result<MediaBuffer>;
}
