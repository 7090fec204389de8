use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;
use serde::{Deserialize, Serialize};

/// 错误类别（`MediaEvent::Error` 的 kind）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Unknown,
}

/// 对外通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaEvent {
    Prepared,
    VideoSizeChanged { width: i32, height: i32 },
    /// 缓冲进度（百分比）
    BufferingUpdate(i32),
    SeekComplete,
    PlaybackComplete,
    Error { kind: ErrorKind, code: i32 },
}

/// 播放器监听器
///
/// 通知总是在播放器内部锁释放之后投递，监听器里可以回调播放器；
/// 但投递线程可能是事件队列线程，实现不应长时间阻塞。
pub trait PlayerListener: Send + Sync {
    fn on_event(&self, event: MediaEvent);
}

/// 把通知转发到 crossbeam 通道，永不阻塞
pub struct ChannelListener {
    tx: Sender<MediaEvent>,
}

impl ChannelListener {
    /// 返回监听器和接收端
    pub fn new() -> (Self, Receiver<MediaEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl PlayerListener for ChannelListener {
    fn on_event(&self, event: MediaEvent) {
        if self.tx.send(event).is_err() {
            debug!("通知接收端已关闭，丢弃事件");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_listener_forwards() {
        let (listener, rx) = ChannelListener::new();
        listener.on_event(MediaEvent::Prepared);
        listener.on_event(MediaEvent::BufferingUpdate(42));
        assert_eq!(rx.try_recv().unwrap(), MediaEvent::Prepared);
        assert_eq!(rx.try_recv().unwrap(), MediaEvent::BufferingUpdate(42));
    }

    #[test]
    fn test_channel_listener_survives_closed_receiver() {
        let (listener, rx) = ChannelListener::new();
        drop(rx);
        listener.on_event(MediaEvent::SeekComplete);
    }
}
