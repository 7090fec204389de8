use crate::core::{MediaBuffer, PlayerError, PrefetchConfig, ReadOptions, Result, TrackFormat};
use crate::player::track::MediaTrack;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 预读缓冲
///
/// 包装后的轨道只引用各自的缓存，不持有预读器本身；
/// 所以拆除时预读器应当只剩播放器这一个引用。
pub trait Prefetcher: Send + Sync {
    fn add_source(&self, track: Box<dyn MediaTrack>) -> Box<dyn MediaTrack>;

    /// 阻塞直到缓存足够、所有轨道读到末尾或超时
    fn prepare(&self);

    /// 所有轨道中最短的已缓存时长
    fn cached_duration_us(&self) -> i64;

    /// 所有轨道都已读到末尾
    fn is_exhausted(&self) -> bool;
}

enum Entry {
    Buffer(MediaBuffer),
    FormatChanged(TrackFormat),
    End(PlayerError),
}

/// 通道里的条目带着 seek 代数，读取方丢弃旧代数的条目
struct Tagged {
    generation: u64,
    entry: Entry,
}

struct CacheState {
    /// 读取方看到的格式
    format: TrackFormat,
    seek_to_us: Option<i64>,
    generation: u64,
    stopping: bool,
    /// 预读线程已送出末尾条目
    ended: bool,
    first_sent_us: Option<i64>,
    last_sent_us: Option<i64>,
    last_read_us: Option<i64>,
}

impl CacheState {
    /// seek 之后重新计数
    fn restart(&mut self) {
        self.ended = false;
        self.first_sent_us = None;
        self.last_sent_us = None;
        self.last_read_us = None;
    }
}

struct TrackCache {
    state: Mutex<CacheState>,
    cond: Condvar,
    /// 只用来查看通道里还排着多少条目
    pending: Receiver<Tagged>,
    max_buffers: usize,
}

impl TrackCache {
    fn cached_us(&self, st: &CacheState) -> i64 {
        if self.pending.is_empty() {
            return 0;
        }
        match (st.last_read_us.or(st.first_sent_us), st.last_sent_us) {
            (Some(head), Some(tail)) => (tail - head).max(0),
            _ => 0,
        }
    }

    /// prepare 可以结束的条件
    fn is_ready(&self, target_us: i64) -> bool {
        let st = self.state.lock();
        st.ended || self.pending.len() >= self.max_buffers || self.cached_us(&st) >= target_us
    }
}

/// 每条轨道一个预读线程，通过有界通道反压
pub struct ReadAheadPrefetcher {
    config: PrefetchConfig,
    stop_timeout: Duration,
    poll_interval: Duration,
    caches: Mutex<Vec<Arc<TrackCache>>>,
}

impl ReadAheadPrefetcher {
    pub fn new(config: PrefetchConfig, stop_timeout: Duration, poll_interval: Duration) -> Self {
        info!(
            "📥 预读器: 每轨 {} 个缓冲, 目标 {} ms",
            config.max_buffers_per_track,
            config.target_cached_us / 1000
        );
        Self {
            config,
            stop_timeout,
            poll_interval,
            caches: Mutex::new(Vec::new()),
        }
    }

    fn fill_loop(cache: Arc<TrackCache>, tx: Sender<Tagged>, mut track: Box<dyn MediaTrack>, poll_interval: Duration) {
        let mut start_error = track.start().err();
        if let Some(e) = &start_error {
            warn!("⚠️ 预读轨道启动失败: {}", e);
        }

        loop {
            let (seek, generation) = {
                let mut st = cache.state.lock();
                // 读到末尾后只等 seek 或停止
                while !st.stopping && st.seek_to_us.is_none() && st.ended {
                    cache.cond.wait(&mut st);
                }
                if st.stopping {
                    break;
                }
                let seek = st.seek_to_us.take();
                if seek.is_some() {
                    st.restart();
                }
                (seek, st.generation)
            };

            let entry = match start_error.take() {
                Some(e) => Entry::End(e),
                None => match track.read(ReadOptions { seek_to_us: seek }) {
                    Ok(buffer) => Entry::Buffer(buffer),
                    Err(PlayerError::FormatChanged) => Entry::FormatChanged(track.format()),
                    Err(e) => {
                        debug!("📥 预读到达末尾: {}", e);
                        Entry::End(e)
                    }
                },
            };
            let timestamp_us = match &entry {
                Entry::Buffer(buffer) => Some(buffer.timestamp_us()),
                _ => None,
            };
            let is_end = matches!(entry, Entry::End(_));

            let mut message = Tagged { generation, entry };
            let delivered = loop {
                match tx.send_timeout(message, poll_interval) {
                    Ok(()) => break true,
                    Err(SendTimeoutError::Timeout(returned)) => {
                        let st = cache.state.lock();
                        if st.stopping || st.generation != generation {
                            // 停止或 seek 后这条已经作废
                            break false;
                        }
                        message = returned;
                    }
                    Err(SendTimeoutError::Disconnected(_)) => break false,
                }
            };

            let mut st = cache.state.lock();
            if delivered && st.generation == generation {
                if let Some(timestamp_us) = timestamp_us {
                    st.first_sent_us.get_or_insert(timestamp_us);
                    st.last_sent_us = Some(timestamp_us);
                }
                if is_end {
                    st.ended = true;
                }
            }
            cache.cond.notify_all();
        }

        track.stop();
    }
}

impl Prefetcher for ReadAheadPrefetcher {
    fn add_source(&self, track: Box<dyn MediaTrack>) -> Box<dyn MediaTrack> {
        let format = track.format();
        let max_buffers = self.config.max_buffers_per_track.max(1);
        let (tx, rx) = bounded::<Tagged>(max_buffers);
        let cache = Arc::new(TrackCache {
            state: Mutex::new(CacheState {
                format: format.clone(),
                seek_to_us: None,
                generation: 0,
                stopping: false,
                ended: false,
                first_sent_us: None,
                last_sent_us: None,
                last_read_us: None,
            }),
            cond: Condvar::new(),
            pending: rx.clone(),
            max_buffers,
        });
        self.caches.lock().push(cache.clone());

        let worker_cache = cache.clone();
        let poll_interval = self.poll_interval;
        let worker = thread::Builder::new()
            .name(format!("prefetch-{}", format.mime))
            .spawn(move || Self::fill_loop(worker_cache, tx, track, poll_interval));

        let (worker, eos) = match worker {
            Ok(handle) => (Some(handle), None),
            Err(e) => {
                cache.state.lock().ended = true;
                (None, Some(PlayerError::Unknown(format!("创建预读线程失败: {}", e))))
            }
        };

        Box::new(PrefetchedTrack {
            cache,
            rx,
            worker,
            eos,
            stopped: false,
            stop_timeout: self.stop_timeout,
            poll_interval: self.poll_interval,
        })
    }

    fn prepare(&self) {
        let deadline = Instant::now() + Duration::from_millis(self.config.prepare_timeout_ms);
        let caches = self.caches.lock().clone();
        loop {
            let pending = caches
                .iter()
                .find(|cache| !cache.is_ready(self.config.target_cached_us));
            let Some(cache) = pending else {
                info!("📥 预读完成, 已缓存 {} ms", self.cached_duration_us() / 1000);
                return;
            };
            let now = Instant::now();
            if now >= deadline {
                warn!("⚠️ 预读超时, 已缓存 {} ms", self.cached_duration_us() / 1000);
                return;
            }
            let mut st = cache.state.lock();
            cache.cond.wait_for(&mut st, (deadline - now).min(Duration::from_millis(50)));
        }
    }

    fn cached_duration_us(&self) -> i64 {
        self.caches
            .lock()
            .iter()
            .filter_map(|cache| {
                let st = cache.state.lock();
                (!st.ended).then(|| cache.cached_us(&st))
            })
            .min()
            .unwrap_or(0)
    }

    fn is_exhausted(&self) -> bool {
        let caches = self.caches.lock();
        !caches.is_empty() && caches.iter().all(|cache| cache.state.lock().ended)
    }
}

/// 经过预读缓冲的轨道
struct PrefetchedTrack {
    cache: Arc<TrackCache>,
    rx: Receiver<Tagged>,
    worker: Option<JoinHandle<()>>,
    /// 已经读到的末尾状态，seek 前一直返回它
    eos: Option<PlayerError>,
    stopped: bool,
    stop_timeout: Duration,
    poll_interval: Duration,
}

impl MediaTrack for PrefetchedTrack {
    fn start(&mut self) -> Result<()> {
        // 底层轨道在预读线程里已经启动
        Ok(())
    }

    fn stop(&mut self) {
        self.stopped = true;
        let Some(handle) = self.worker.take() else {
            return;
        };
        self.cache.state.lock().stopping = true;
        self.cache.cond.notify_all();

        // 有界轮询，等底层解码完全停下
        let deadline = Instant::now() + self.stop_timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(self.poll_interval);
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            warn!("⚠️ 预读线程 {:?} 未能在 {:?} 内退出", handle.thread().name(), self.stop_timeout);
        }
        for _ in self.rx.try_iter() {}
    }

    fn format(&self) -> TrackFormat {
        self.cache.state.lock().format.clone()
    }

    fn read(&mut self, options: ReadOptions) -> Result<MediaBuffer> {
        if self.stopped {
            return Err(PlayerError::EndOfStream);
        }

        let generation = {
            let mut st = self.cache.state.lock();
            if let Some(time_us) = options.seek_to_us {
                st.seek_to_us = Some(time_us);
                st.generation += 1;
                st.restart();
                self.eos = None;
                self.cache.cond.notify_all();
            }
            st.generation
        };
        if options.seek_to_us.is_some() {
            for _ in self.rx.try_iter() {}
        }

        loop {
            if let Some(e) = &self.eos {
                return Err(e.clone());
            }
            let tagged = match self.rx.recv() {
                Ok(tagged) => tagged,
                Err(_) => return Err(PlayerError::EndOfStream),
            };
            if tagged.generation != generation {
                continue;
            }
            match tagged.entry {
                Entry::Buffer(buffer) => {
                    self.cache.state.lock().last_read_us = Some(buffer.timestamp_us());
                    return Ok(buffer);
                }
                Entry::FormatChanged(format) => {
                    self.cache.state.lock().format = format;
                    return Err(PlayerError::FormatChanged);
                }
                Entry::End(e) => {
                    self.cache.state.lock().ended = true;
                    self.eos = Some(e);
                }
            }
        }
    }
}

impl Drop for PrefetchedTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::test_support::{video_track, Step};

    fn prefetcher(max_buffers: usize, target_us: i64) -> ReadAheadPrefetcher {
        ReadAheadPrefetcher::new(
            PrefetchConfig {
                max_buffers_per_track: max_buffers,
                target_cached_us: target_us,
                prepare_timeout_ms: 2_000,
            },
            Duration::from_secs(2),
            Duration::from_millis(1),
        )
    }

    #[test]
    fn test_prepare_fills_cache_and_reads_in_order() {
        let (track, log) = video_track(10, 40_000, 4, 4);
        let prefetcher = prefetcher(64, 120_000);
        let mut wrapped = prefetcher.add_source(Box::new(track));
        prefetcher.prepare();
        assert!(prefetcher.cached_duration_us() >= 120_000 || prefetcher.is_exhausted());

        wrapped.start().unwrap();
        for i in 0..10 {
            let buffer = wrapped.read(ReadOptions::default()).unwrap();
            assert_eq!(buffer.timestamp_us(), i * 40_000);
        }
        assert_eq!(wrapped.read(ReadOptions::default()).unwrap_err(), PlayerError::EndOfStream);
        assert!(prefetcher.is_exhausted());

        wrapped.stop();
        assert!(log.stopped());
        assert_eq!(log.acquired(), log.released());
    }

    #[test]
    fn test_bounded_queue_applies_backpressure() {
        let (track, log) = video_track(100, 10_000, 2, 2);
        let prefetcher = prefetcher(4, i64::MAX);
        let mut wrapped = prefetcher.add_source(Box::new(track));
        prefetcher.prepare();
        thread::sleep(Duration::from_millis(20));
        // 队列满 4 个后，最多还有一个在途读取
        assert!(log.reads() <= 5);
        wrapped.stop();
    }

    #[test]
    fn test_seek_flushes_cache() {
        let (track, log) = video_track(20, 10_000, 2, 2);
        let prefetcher = prefetcher(8, 50_000);
        let mut wrapped = prefetcher.add_source(Box::new(track));
        prefetcher.prepare();

        let buffer = wrapped.read(ReadOptions::seek_to(150_000)).unwrap();
        assert_eq!(buffer.timestamp_us(), 150_000);
        assert!(log.seeks().contains(&150_000));
        drop(buffer);

        wrapped.stop();
        assert_eq!(log.acquired(), log.released());
    }

    #[test]
    fn test_seek_after_end_refills_channel() {
        let (track, log) = video_track(3, 10_000, 2, 2);
        let prefetcher = prefetcher(2, 0);
        let mut wrapped = prefetcher.add_source(Box::new(track));

        for _ in 0..3 {
            wrapped.read(ReadOptions::default()).unwrap();
        }
        assert_eq!(wrapped.read(ReadOptions::default()).unwrap_err(), PlayerError::EndOfStream);
        // 末尾状态保持到下一次 seek
        assert_eq!(wrapped.read(ReadOptions::default()).unwrap_err(), PlayerError::EndOfStream);
        assert!(prefetcher.is_exhausted());

        let buffer = wrapped.read(ReadOptions::seek_to(0)).unwrap();
        assert_eq!(buffer.timestamp_us(), 0);
        assert!(log.seeks().contains(&0));
        drop(buffer);
        wrapped.stop();
        assert_eq!(log.acquired(), log.released());
    }

    #[test]
    fn test_format_change_is_forwarded() {
        let (mut track, _log) = video_track(2, 10_000, 2, 2);
        let bigger = track.format().with_size(4, 4);
        track.insert_step(1, Step::FormatChanged(bigger.clone()));
        let prefetcher = prefetcher(8, 0);
        let mut wrapped = prefetcher.add_source(Box::new(track));

        assert!(wrapped.read(ReadOptions::default()).is_ok());
        assert_eq!(wrapped.read(ReadOptions::default()).unwrap_err(), PlayerError::FormatChanged);
        assert_eq!(wrapped.format(), bigger);
        assert!(wrapped.read(ReadOptions::default()).is_ok());
    }

    #[test]
    fn test_wrapped_tracks_do_not_share_prefetcher() {
        let prefetcher = Arc::new(prefetcher(4, 0));
        let (track, _log) = video_track(1, 10_000, 2, 2);
        let mut wrapped = prefetcher.add_source(Box::new(track));
        assert_eq!(Arc::strong_count(&prefetcher), 1);
        wrapped.stop();
    }
}
