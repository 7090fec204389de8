use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 事件 ID，由队列在投递时分配
pub type EventId = u64;

/// 队列中尚未触发的事件（测试与诊断使用）
#[derive(Debug, Clone)]
pub struct PendingEvent<E> {
    pub id: EventId,
    pub event: E,
    /// 距离触发还剩多久
    pub remaining: Duration,
}

struct Entry<E> {
    when: Instant,
    id: EventId,
    event: E,
}

// BinaryHeap 是大顶堆，这里反转比较得到"最早触发在堆顶"；
// 同一时刻按投递顺序触发。
impl<E> Ord for Entry<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.when.cmp(&self.when).then_with(|| other.id.cmp(&self.id))
    }
}

impl<E> PartialOrd for Entry<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> PartialEq for Entry<E> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.when == other.when
    }
}

impl<E> Eq for Entry<E> {}

struct QueueState<E> {
    heap: BinaryHeap<Entry<E>>,
    next_id: EventId,
    running: bool,
    thread_id: Option<ThreadId>,
}

struct QueueShared<E> {
    state: Mutex<QueueState<E>>,
    cond: Condvar,
}

/// 单线程定时事件队列
///
/// 一个后台线程按触发时间从小顶堆取事件并回调。回调总在队列线程上执行，
/// 从不在调用方线程上执行。取消是尽力而为的：已经出堆、正在回调的事件
/// 不受影响，回调方必须自行确认事件仍然有效。
pub struct TimedEventQueue<E: Send + 'static> {
    name: String,
    shared: Arc<QueueShared<E>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Send + 'static> TimedEventQueue<E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState {
                    heap: BinaryHeap::new(),
                    next_id: 1,
                    running: false,
                    thread_id: None,
                }),
                cond: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// 启动队列线程；已启动时什么都不做
    pub fn start<F>(&self, handler: F)
    where
        F: FnMut(EventId, E) + Send + 'static,
    {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        self.shared.state.lock().running = true;

        let shared = self.shared.clone();
        let name = self.name.clone();
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || Self::run(shared, handler));

        match spawned {
            Ok(handle) => {
                info!("{} ▶️ 事件队列 {} 已启动", log_ctx(), name);
                *worker = Some(handle);
            }
            Err(e) => {
                // 线程创建失败时保持"未启动"，事件留在堆里
                log::error!("{} ❌ 事件队列 {} 启动失败: {}", log_ctx(), name, e);
                self.shared.state.lock().running = false;
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// 停止队列线程并丢弃所有未触发的事件
    ///
    /// 在队列线程外调用时会阻塞到线程退出。
    pub fn stop(&self) {
        let handle = self.worker.lock().take();
        let Some(handle) = handle else {
            return;
        };

        let on_queue_thread = {
            let mut st = self.shared.state.lock();
            st.running = false;
            st.heap.clear();
            st.thread_id == Some(thread::current().id())
        };
        self.shared.cond.notify_all();

        if on_queue_thread {
            // 自己等不到自己退出，回调返回后线程会看到 running=false
            debug!("{} 事件队列 {} 在自身线程上停止，跳过 join", log_ctx(), self.name);
            return;
        }

        let _ = handle.join();
        info!("{} ⏹ 事件队列 {} 已停止", log_ctx(), self.name);
    }

    pub fn post_event(&self, event: E) -> EventId {
        self.post_event_with_delay(event, 0)
    }

    /// 投递事件，`delay_us` 微秒后触发（负数按 0 处理）
    pub fn post_event_with_delay(&self, event: E, delay_us: i64) -> EventId {
        let when = Instant::now() + Duration::from_micros(delay_us.max(0) as u64);
        let id = {
            let mut st = self.shared.state.lock();
            let id = st.next_id;
            st.next_id += 1;
            st.heap.push(Entry { when, id, event });
            id
        };
        self.shared.cond.notify_one();
        id
    }

    /// 取消尚未出堆的事件，返回是否真的移除了
    pub fn cancel_event(&self, id: EventId) -> bool {
        let removed = {
            let mut st = self.shared.state.lock();
            let before = st.heap.len();
            st.heap.retain(|entry| entry.id != id);
            st.heap.len() != before
        };
        if removed {
            self.shared.cond.notify_one();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 当前线程是否是本队列的回调线程
    pub fn is_queue_thread(&self) -> bool {
        self.shared.state.lock().thread_id == Some(thread::current().id())
    }

    /// 按触发顺序列出尚未触发的事件
    pub fn pending(&self) -> Vec<PendingEvent<E>>
    where
        E: Clone,
    {
        let now = Instant::now();
        let st = self.shared.state.lock();
        let mut entries: Vec<&Entry<E>> = st.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
            .into_iter()
            .map(|entry| PendingEvent {
                id: entry.id,
                event: entry.event.clone(),
                remaining: entry.when.saturating_duration_since(now),
            })
            .collect()
    }

    fn run<F>(shared: Arc<QueueShared<E>>, mut handler: F)
    where
        F: FnMut(EventId, E),
    {
        shared.state.lock().thread_id = Some(thread::current().id());

        loop {
            let (id, event) = {
                let mut st = shared.state.lock();
                loop {
                    if !st.running {
                        st.thread_id = None;
                        return;
                    }
                    let now = Instant::now();
                    match st.heap.peek().map(|entry| entry.when) {
                        None => shared.cond.wait(&mut st),
                        Some(when) if when <= now => {
                            if let Some(entry) = st.heap.pop() {
                                break (entry.id, entry.event);
                            }
                        }
                        Some(when) => {
                            shared.cond.wait_until(&mut st, when);
                        }
                    }
                }
            };

            handler(id, event);
        }
    }
}

impl<E: Send + 'static> Drop for TimedEventQueue<E> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_fires_in_time_order() {
        let queue = TimedEventQueue::new("test-order");
        let (tx, rx) = unbounded();
        queue.post_event_with_delay("late", 30_000);
        queue.post_event_with_delay("early", 5_000);
        queue.post_event("now");
        queue.start(move |_, name| {
            let _ = tx.send(name);
        });

        let order: Vec<&str> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, vec!["now", "early", "late"]);
        queue.stop();
    }

    #[test]
    fn test_cancel_before_fire() {
        let queue = TimedEventQueue::new("test-cancel");
        let (tx, rx) = unbounded();
        let cancelled = queue.post_event_with_delay(1, 20_000);
        queue.post_event_with_delay(2, 40_000);
        assert!(queue.cancel_event(cancelled));
        assert!(!queue.cancel_event(cancelled));
        queue.start(move |_, n| {
            let _ = tx.send(n);
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        queue.stop();
    }

    #[test]
    fn test_pending_snapshot_before_start() {
        let queue = TimedEventQueue::new("test-pending");
        queue.post_event_with_delay('b', 10_000);
        queue.post_event('a');
        let pending = queue.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].event, 'a');
        assert!(pending[0].remaining <= Duration::from_millis(1));
        assert!(pending[1].remaining > Duration::from_millis(5));
        assert!(!queue.is_started());
    }

    #[test]
    fn test_stop_discards_and_is_idempotent() {
        let queue = TimedEventQueue::new("test-stop");
        queue.start(|_, _: u32| {});
        queue.post_event_with_delay(7, 1_000_000);
        assert_eq!(queue.len(), 1);
        queue.stop();
        queue.stop();
        assert!(queue.is_empty());
        assert!(!queue.is_started());
    }

    #[test]
    fn test_callback_runs_on_queue_thread() {
        let queue = Arc::new(TimedEventQueue::new("test-thread"));
        let (tx, rx) = unbounded();
        let weak = Arc::downgrade(&queue);
        queue.start(move |_, _: ()| {
            let on_queue = weak.upgrade().map(|q| q.is_queue_thread()).unwrap_or(false);
            let _ = tx.send(on_queue);
        });
        queue.post_event(());
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        assert!(!queue.is_queue_thread());
        queue.stop();
    }
}
