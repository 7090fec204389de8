use std::time::Instant;

/// 时间源：决定音视频同步里的"现在"
///
/// 音频激活后由音频播放器充当（按已播放的采样数推进），否则回退到墙钟。
pub trait TimeSource: Send {
    /// 当前真实时间（微秒），只要求单调
    fn real_time_us(&self) -> i64;
}

/// 墙钟时间源
pub struct SystemTimeSource {
    base_instant: Instant,  // 基准时刻
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            base_instant: Instant::now(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn real_time_us(&self) -> i64 {
        self.base_instant.elapsed().as_micros() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_system_time_source_advances() {
        let clock = SystemTimeSource::new();
        let first = clock.real_time_us();
        thread::sleep(Duration::from_millis(5));
        let second = clock.real_time_us();
        assert!(second - first >= 5_000);
    }
}
