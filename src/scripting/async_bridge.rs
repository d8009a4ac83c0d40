//! 异步解析桥
//!
//! VM 是单线程的同步调用/返回模型；宿主的网络、文件、定时器等操作是真正异步的。
//! 桥把两者连接起来：
//!
//! 1. 外部方法收到一个续体对象（脚本侧的 Promise），导出为 [`Handle`]，
//!    调用 [`AsyncBridge::begin`] / [`AsyncBridge::spawn`] 登记一次操作后立即返回
//! 2. 工作线程完成后通过 [`Settler`] 把结果送进 crossbeam 通道
//! 3. VM 空闲时宿主调用 [`AsyncBridge::pump`]，按到达顺序逐个重新进入 VM：
//!    槽位布置为 `[续体, 是否成功, 值]`，调用 `resolve_(_,_)`
//! 4. 续体在解析完成后恰好释放一次
//!
//! 任意时刻最多只有一次 VM 重入；VM 正在执行时 pump 会推迟，队列保持不变。

use crate::bindings::marshal::HostValue;
use crate::bindings::CallHandles;
use crate::core::error::{AsyncError, AsyncResult, BridgeError, BridgeResult, MarshalError, SlotResult};
use crate::scripting::scheduler::HostScheduler;
use crate::vm::{Handle, SlotType, Vm};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use futures::FutureExt;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

/// 异步操作编号
pub type OperationId = u64;

const DROPPED_MESSAGE: &str = "operation dropped before settling";

/// 可以交付给续体的值
///
/// 只有标量、文本、字节和句柄；列表/映射结果必须先在宿主侧转换。
#[derive(Debug)]
pub enum AsyncValue {
    Null,
    Bool(bool),
    Num(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// VM 对象，解析时写回槽位，随后释放
    Handle(Handle),
}

impl AsyncValue {
    fn write(&self, vm: &mut dyn Vm, slot: usize) -> SlotResult<()> {
        match self {
            Self::Null => vm.set_slot_null(slot),
            Self::Bool(b) => vm.set_slot_bool(slot, *b),
            Self::Num(n) => vm.set_slot_double(slot, *n),
            Self::Text(text) => vm.set_slot_string(slot, text),
            Self::Bytes(bytes) => vm.set_slot_bytes(slot, bytes),
            Self::Handle(handle) => vm.set_slot_handle(slot, handle),
        }
    }
}

impl TryFrom<HostValue> for AsyncValue {
    type Error = MarshalError;

    fn try_from(value: HostValue) -> Result<Self, Self::Error> {
        match value {
            HostValue::Null => Ok(Self::Null),
            HostValue::Bool(b) => Ok(Self::Bool(b)),
            HostValue::Num(n) => Ok(Self::Num(n)),
            HostValue::Text(text) => Ok(Self::Text(text)),
            HostValue::Bytes(bytes) => Ok(Self::Bytes(bytes)),
            other => Err(MarshalError::UnsupportedType(format!(
                "{} cannot be delivered to a continuation",
                other.type_name()
            ))),
        }
    }
}

/// 宿主操作的结果：成功值或失败消息
pub type Outcome = Result<HostValue, String>;

enum Message {
    Progress { op: OperationId, fraction: f64 },
    Settled { op: OperationId, outcome: Outcome },
}

/// 在 VM 线程上把宿主值转换为可交付值，例如构造 VM 对象并返回其句柄
pub type Finisher = Box<dyn FnOnce(&mut dyn Vm, HostValue) -> BridgeResult<AsyncValue>>;

struct Pending {
    continuation: Handle,
    finisher: Option<Finisher>,
}

enum Queued {
    Progress { op: OperationId, fraction: f64 },
    Settled { op: OperationId, outcome: Outcome },
    Ready { op: OperationId, outcome: Result<AsyncValue, String> },
}

impl From<Message> for Queued {
    fn from(message: Message) -> Self {
        match message {
            Message::Progress { op, fraction } => Self::Progress { op, fraction },
            Message::Settled { op, outcome } => Self::Settled { op, outcome },
        }
    }
}

/// 桥的累计统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// 登记的操作数
    pub started: u64,
    /// 已交付给续体的结算数
    pub settled: u64,
    /// `resolve_(_,_)` 调用次数（含链式重复调用）
    pub resolve_calls: u64,
    pub progress_calls: u64,
    /// 交付失败数（VM 报错或槽位错误）
    pub failures: u64,
    /// 取消或销毁后到达、被丢弃的结算与进度
    pub diverted: u64,
}

/// 单次 pump 的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    /// VM 忙或已有 pump 在运行，本次什么也没做
    pub deferred: bool,
    pub resolved: usize,
    pub progressed: usize,
    pub failed: usize,
    pub diverted: usize,
}

#[derive(Default)]
struct BridgeState {
    pending: HashMap<OperationId, Pending>,
    queue: VecDeque<Queued>,
    calls: Option<Rc<CallHandles>>,
    pumping: bool,
    /// 正在执行 `progress_(_)` 的操作，以及期间是否被取消
    progressing: Option<(OperationId, bool)>,
    torn_down: bool,
    next_op: OperationId,
    stats: BridgeStats,
}

/// 异步解析桥
///
/// 只在 VM 线程上使用；克隆共享同一状态。
#[derive(Clone)]
pub struct AsyncBridge {
    state: Rc<RefCell<BridgeState>>,
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    scheduler: Rc<HostScheduler>,
}

impl AsyncBridge {
    pub fn new(scheduler: Rc<HostScheduler>) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            state: Rc::new(RefCell::new(BridgeState::default())),
            sender,
            receiver,
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &Rc<HostScheduler> {
        &self.scheduler
    }

    /// 使用宿主已有的调用句柄；未设置时 pump 首次运行会自行创建
    pub fn attach_calls(&self, calls: Rc<CallHandles>) {
        self.state.borrow_mut().calls = Some(calls);
    }

    fn register(&self, continuation: Handle, finisher: Option<Finisher>) -> AsyncResult<OperationId> {
        let mut state = self.state.borrow_mut();
        if state.torn_down {
            return Err(AsyncError::TornDown);
        }
        state.next_op += 1;
        let op = state.next_op;
        state.pending.insert(
            op,
            Pending {
                continuation,
                finisher,
            },
        );
        state.stats.started += 1;
        tracing::debug!(target: "bridge.async", "Operation {} started", op);
        Ok(op)
    }

    /// 登记一次操作，返回可跨线程结算的 [`Settler`]
    pub fn begin(&self, continuation: Handle) -> AsyncResult<Settler> {
        let op = self.register(continuation, None)?;
        Ok(Settler::new(op, self.sender.clone()))
    }

    /// 登记一次带终结转换的操作
    pub fn begin_with_finisher<F>(&self, continuation: Handle, finisher: F) -> AsyncResult<Settler>
    where
        F: FnOnce(&mut dyn Vm, HostValue) -> BridgeResult<AsyncValue> + 'static,
    {
        let op = self.register(continuation, Some(Box::new(finisher)))?;
        Ok(Settler::new(op, self.sender.clone()))
    }

    /// 在调度器上运行异步任务，完成后解析续体
    pub fn spawn<T, Fut>(&self, continuation: Handle, task: T) -> AsyncResult<OperationId>
    where
        T: FnOnce(ProgressReporter) -> Fut,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let settler = self.begin(continuation)?;
        Ok(self.run(settler, task))
    }

    /// 同 [`spawn`](Self::spawn)，结果在 VM 线程上经 `finisher` 转换后交付
    pub fn spawn_with_finisher<T, Fut, F>(
        &self,
        continuation: Handle,
        task: T,
        finisher: F,
    ) -> AsyncResult<OperationId>
    where
        T: FnOnce(ProgressReporter) -> Fut,
        Fut: Future<Output = Outcome> + Send + 'static,
        F: FnOnce(&mut dyn Vm, HostValue) -> BridgeResult<AsyncValue> + 'static,
    {
        let settler = self.begin_with_finisher(continuation, finisher)?;
        Ok(self.run(settler, task))
    }

    fn run<T, Fut>(&self, settler: Settler, task: T) -> OperationId
    where
        T: FnOnce(ProgressReporter) -> Fut,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let op = settler.id();
        let future = task(settler.reporter());
        let job = async move {
            let outcome = future.await;
            settler.settle(outcome);
        }
        .boxed();
        // 调度器已关闭时任务连同 Settler 一起被丢弃，续体以失败解析
        if let Err(err) = self.scheduler.spawn_boxed(job) {
            tracing::warn!(target: "bridge.async", "Operation {} not scheduled: {}", op, err);
        }
        op
    }

    /// 登记一个结果已知的操作，下一次 pump 时交付
    pub fn settle_ready(
        &self,
        continuation: Handle,
        outcome: Result<AsyncValue, String>,
    ) -> AsyncResult<OperationId> {
        let op = self.register(continuation, None)?;
        self.state
            .borrow_mut()
            .queue
            .push_back(Queued::Ready { op, outcome });
        Ok(op)
    }

    /// 取消操作：续体立即释放，之后到达的结算被丢弃
    pub fn cancel(&self, op: OperationId) -> bool {
        let removed = {
            let mut state = self.state.borrow_mut();
            if state.progressing == Some((op, false)) {
                // 进度回调期间续体不在登记表中，回调结束后释放
                state.progressing = Some((op, true));
                tracing::debug!(target: "bridge.async", "Operation {} cancelled during progress", op);
                return true;
            }
            state.pending.remove(&op)
        };
        if removed.is_some() {
            tracing::debug!(target: "bridge.async", "Operation {} cancelled", op);
        }
        removed.is_some()
    }

    /// 销毁：释放所有续体，此后的结算全部丢弃，新操作被拒绝
    pub fn teardown(&self) {
        let (pending, queued) = {
            let mut state = self.state.borrow_mut();
            if state.torn_down {
                return;
            }
            state.torn_down = true;
            let pending: Vec<Pending> = state.pending.drain().map(|(_, p)| p).collect();
            let queued: Vec<Queued> = state.queue.drain(..).collect();
            state.stats.diverted += queued.len() as u64;
            (pending, queued)
        };
        tracing::debug!(
            target: "bridge.async",
            "Async bridge torn down ({} pending, {} queued)",
            pending.len(),
            queued.len()
        );
        // 借用结束后再释放句柄
        drop(pending);
        drop(queued);
    }

    pub fn is_torn_down(&self) -> bool {
        self.state.borrow().torn_down
    }

    pub fn pending_count(&self) -> usize {
        let state = self.state.borrow();
        let progressing = matches!(state.progressing, Some((_, false)));
        state.pending.len() + usize::from(progressing)
    }

    /// 是否有等待交付的消息
    pub fn has_queued(&self) -> bool {
        !self.state.borrow().queue.is_empty() || !self.receiver.is_empty()
    }

    pub fn stats(&self) -> BridgeStats {
        self.state.borrow().stats
    }

    /// 阻塞等待至少一条消息到达或超时
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.has_queued() {
            return true;
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => {
                self.state.borrow_mut().queue.push_back(message.into());
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    fn collect_messages(&self, state: &mut BridgeState) {
        while let Ok(message) = self.receiver.try_recv() {
            state.queue.push_back(message.into());
        }
    }

    fn call_handles(&self, vm: &mut dyn Vm) -> BridgeResult<Rc<CallHandles>> {
        if let Some(calls) = self.state.borrow().calls.clone() {
            return Ok(calls);
        }
        let calls = CallHandles::make(vm)?;
        self.state.borrow_mut().calls = Some(Rc::clone(&calls));
        Ok(calls)
    }

    /// 按到达顺序交付所有已结算的操作
    pub fn pump(&self, vm: &mut dyn Vm) -> PumpReport {
        let mut report = PumpReport::default();
        {
            let mut state = self.state.borrow_mut();
            self.collect_messages(&mut state);
            if state.torn_down {
                // 销毁后不再进入 VM，迟到的消息只计数
                report.diverted = state.queue.len();
                state.stats.diverted += report.diverted as u64;
                state.queue.clear();
                return report;
            }
            if state.pumping || vm.call_depth() > 0 {
                report.deferred = true;
                return report;
            }
            if state.queue.is_empty() {
                return report;
            }
            state.pumping = true;
        }

        let calls = match self.call_handles(vm) {
            Ok(calls) => calls,
            Err(err) => {
                tracing::error!(target: "bridge.async", "Cannot create call handles: {}", err);
                self.state.borrow_mut().pumping = false;
                return report;
            }
        };

        loop {
            // 每次只取一条，重新进入 VM 期间不持有借用
            let next = self.state.borrow_mut().queue.pop_front();
            let Some(item) = next else {
                break;
            };
            match item {
                Queued::Progress { op, fraction } => self.deliver_progress(vm, &calls, op, fraction, &mut report),
                Queued::Settled { op, outcome } => {
                    let Some(pending) = self.take_pending(op, &mut report) else {
                        continue;
                    };
                    let outcome = finish(vm, pending.finisher, outcome);
                    self.resolve(vm, &calls, op, pending.continuation, outcome, &mut report);
                }
                Queued::Ready { op, outcome } => {
                    let Some(pending) = self.take_pending(op, &mut report) else {
                        continue;
                    };
                    self.resolve(vm, &calls, op, pending.continuation, outcome, &mut report);
                }
            }
        }

        let mut state = self.state.borrow_mut();
        state.pumping = false;
        state.stats.diverted += report.diverted as u64;
        report
    }

    fn take_pending(&self, op: OperationId, report: &mut PumpReport) -> Option<Pending> {
        let pending = self.state.borrow_mut().pending.remove(&op);
        if pending.is_none() {
            tracing::warn!(target: "bridge.async", "Settlement of operation {} diverted", op);
            report.diverted += 1;
        }
        pending
    }

    fn deliver_progress(
        &self,
        vm: &mut dyn Vm,
        calls: &CallHandles,
        op: OperationId,
        fraction: f64,
        report: &mut PumpReport,
    ) {
        // 进度调用期间暂时取出，调用后放回；期间被取消则释放
        let pending = {
            let mut state = self.state.borrow_mut();
            let pending = state.pending.remove(&op);
            if pending.is_some() {
                state.progressing = Some((op, false));
            }
            pending
        };
        let Some(pending) = pending else {
            report.diverted += 1;
            return;
        };

        let staged = (|| -> SlotResult<()> {
            vm.ensure_slots(2)?;
            vm.set_slot_handle(0, &pending.continuation)?;
            vm.set_slot_double(1, fraction)
        })();
        match staged {
            Ok(()) => {
                self.state.borrow_mut().stats.progress_calls += 1;
                if calls.invoke(vm, &calls.progress_1).is_success() {
                    report.progressed += 1;
                } else {
                    report.failed += 1;
                    self.state.borrow_mut().stats.failures += 1;
                }
            }
            Err(err) => {
                tracing::error!(target: "bridge.async", "Cannot stage progress for operation {}: {}", op, err);
                report.failed += 1;
                self.state.borrow_mut().stats.failures += 1;
            }
        }

        let mut state = self.state.borrow_mut();
        let cancelled = matches!(state.progressing.take(), Some((_, true)));
        if state.torn_down || cancelled {
            drop(state);
            // 续体恰好释放一次
            drop(pending);
            return;
        }
        state.pending.insert(op, pending);
    }

    fn resolve(
        &self,
        vm: &mut dyn Vm,
        calls: &CallHandles,
        op: OperationId,
        continuation: Handle,
        outcome: Result<AsyncValue, String>,
        report: &mut PumpReport,
    ) {
        let (success, value) = match outcome {
            Ok(value) => (true, value),
            Err(message) => (false, AsyncValue::Text(message)),
        };
        tracing::debug!(target: "bridge.async", "Resolving operation {} (success: {})", op, success);

        let mut first = true;
        let failed = loop {
            let staged = if first {
                stage(vm, &continuation, Some((success, &value)))
            } else {
                stage(vm, &continuation, None)
            };
            if let Err(err) = staged {
                tracing::error!(target: "bridge.async", "Cannot stage resolution of operation {}: {}", op, err);
                break true;
            }
            first = false;
            self.state.borrow_mut().stats.resolve_calls += 1;
            if !calls.invoke(vm, &calls.resolve_2).is_success() {
                break true;
            }
            // slot 0 为 Bool 表示解析完成，其余值请求再次调用（链式续体）
            if matches!(vm.slot_type(0), Ok(SlotType::Bool)) {
                break false;
            }
        };

        let mut state = self.state.borrow_mut();
        state.stats.settled += 1;
        if failed {
            state.stats.failures += 1;
            report.failed += 1;
        } else {
            report.resolved += 1;
        }
        drop(state);
        drop(value);
        // 续体恰好释放一次
        drop(continuation);
    }
}

/// 布置 `[续体, 是否成功, 值]`；链式重复调用时后两项为 null
fn stage(vm: &mut dyn Vm, continuation: &Handle, result: Option<(bool, &AsyncValue)>) -> SlotResult<()> {
    vm.ensure_slots(3)?;
    vm.set_slot_handle(0, continuation)?;
    match result {
        Some((success, value)) => {
            vm.set_slot_bool(1, success)?;
            value.write(vm, 2)
        }
        None => {
            vm.set_slot_null(1)?;
            vm.set_slot_null(2)
        }
    }
}

fn finish(vm: &mut dyn Vm, finisher: Option<Finisher>, outcome: Outcome) -> Result<AsyncValue, String> {
    let value = outcome?;
    match finisher {
        Some(finisher) => finisher(vm, value).map_err(|err| err.abort_message()),
        None => AsyncValue::try_from(value).map_err(|err| BridgeError::from(err).abort_message()),
    }
}

/// 跨线程的进度上报端
#[derive(Clone)]
pub struct ProgressReporter {
    op: OperationId,
    sender: Sender<Message>,
}

impl ProgressReporter {
    /// 上报进度（0.0..=1.0）
    pub fn report(&self, fraction: f64) {
        let _ = self.sender.send(Message::Progress {
            op: self.op,
            fraction: fraction.clamp(0.0, 1.0),
        });
    }
}

/// 一次操作的结算端
///
/// 可以在任意线程上结算；未结算就被丢弃时以失败结算，续体不会永远悬空。
pub struct Settler {
    op: OperationId,
    sender: Sender<Message>,
    settled: bool,
}

impl Settler {
    fn new(op: OperationId, sender: Sender<Message>) -> Self {
        Self {
            op,
            sender,
            settled: false,
        }
    }

    pub fn id(&self) -> OperationId {
        self.op
    }

    pub fn reporter(&self) -> ProgressReporter {
        ProgressReporter {
            op: self.op,
            sender: self.sender.clone(),
        }
    }

    pub fn progress(&self, fraction: f64) {
        self.reporter().report(fraction);
    }

    pub fn resolve(self, value: impl Into<HostValue>) {
        self.settle(Ok(value.into()));
    }

    pub fn reject(self, message: impl Into<String>) {
        self.settle(Err(message.into()));
    }

    pub fn settle(mut self, outcome: Outcome) {
        self.send(outcome);
    }

    fn send(&mut self, outcome: Outcome) {
        self.settled = true;
        let _ = self.sender.send(Message::Settled {
            op: self.op,
            outcome,
        });
    }
}

impl Drop for Settler {
    fn drop(&mut self) {
        if !self.settled {
            self.send(Err(DROPPED_MESSAGE.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::ForeignRegistry;
    use crate::config::{SchedulerConfig, VmConfig};
    use crate::services::promise_library;
    use crate::vm::sandbox::{SandboxVm, ScriptLibrary, Value};
    use std::cell::Cell;

    fn scheduler() -> Rc<HostScheduler> {
        Rc::new(
            HostScheduler::new(&SchedulerConfig {
                worker_threads: 1,
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn promise_vm() -> SandboxVm {
        let mut library = ScriptLibrary::new();
        library.extend(&promise_library("main"));
        let mut vm = SandboxVm::new(&VmConfig::default(), Rc::new(ForeignRegistry::new()), Rc::new(library));
        assert!(vm.interpret("main", "class Promise").is_success());
        vm
    }

    fn new_promise(vm: &mut SandboxVm, name: &str) -> Handle {
        assert!(vm
            .interpret("main", &format!("var {} = Promise.new()", name))
            .is_success());
        vm.ensure_slots(1).unwrap();
        vm.get_variable("main", name, 0).unwrap();
        vm.get_slot_handle(0).unwrap()
    }

    fn read(vm: &mut SandboxVm, promise: &str, getter: &str) -> HostValue {
        let handle = vm.make_call_handle(getter).unwrap();
        vm.ensure_slots(1).unwrap();
        vm.get_variable("main", promise, 0).unwrap();
        assert!(vm.call(&handle).is_success());
        crate::bindings::read_slot(vm, 0).unwrap()
    }

    #[test]
    fn test_ready_results_resolve_in_order() {
        let bridge = AsyncBridge::new(scheduler());
        let mut vm = promise_vm();
        let a = new_promise(&mut vm, "a");
        let b = new_promise(&mut vm, "b");

        bridge.settle_ready(a, Ok(AsyncValue::Num(1.0))).unwrap();
        bridge.settle_ready(b, Err("missing".to_string())).unwrap();
        let report = bridge.pump(&mut vm);
        assert_eq!(report.resolved, 2);

        assert_eq!(read(&mut vm, "a", "state"), HostValue::Text("resolved".into()));
        assert_eq!(read(&mut vm, "a", "value"), HostValue::Num(1.0));
        assert_eq!(read(&mut vm, "b", "state"), HostValue::Text("rejected".into()));
        assert_eq!(read(&mut vm, "b", "value"), HostValue::Text("missing".into()));
        assert_eq!(bridge.pending_count(), 0);
        assert_eq!(vm.handle_root_count(), 0);
    }

    #[test]
    fn test_dropped_settler_fails_once() {
        let bridge = AsyncBridge::new(scheduler());
        let mut vm = promise_vm();
        let p = new_promise(&mut vm, "p");

        let settler = bridge.begin(p).unwrap();
        drop(settler);
        bridge.pump(&mut vm);

        assert_eq!(read(&mut vm, "p", "settleCount"), HostValue::Num(1.0));
        assert_eq!(read(&mut vm, "p", "value"), HostValue::Text(DROPPED_MESSAGE.into()));
        assert_eq!(bridge.stats().settled, 1);
    }

    #[test]
    fn test_spawned_task_reports_progress() {
        let bridge = AsyncBridge::new(scheduler());
        let mut vm = promise_vm();
        let p = new_promise(&mut vm, "p");

        bridge
            .spawn(p, |progress| async move {
                progress.report(0.5);
                Ok(HostValue::Text("done".into()))
            })
            .unwrap();
        while bridge.pending_count() > 0 {
            assert!(bridge.wait(Duration::from_secs(5)));
            bridge.pump(&mut vm);
        }

        assert_eq!(read(&mut vm, "p", "progress"), HostValue::Num(0.5));
        assert_eq!(read(&mut vm, "p", "value"), HostValue::Text("done".into()));
        let stats = bridge.stats();
        assert_eq!(stats.progress_calls, 1);
        assert_eq!(stats.resolve_calls, 1);
    }

    #[test]
    fn test_cancelled_operation_is_diverted() {
        let bridge = AsyncBridge::new(scheduler());
        let mut vm = promise_vm();
        let p = new_promise(&mut vm, "p");

        let settler = bridge.begin(p).unwrap();
        assert!(bridge.cancel(settler.id()));
        assert_eq!(vm.handle_root_count(), 0);
        settler.resolve(1.0);

        let report = bridge.pump(&mut vm);
        assert_eq!(report.diverted, 1);
        assert_eq!(read(&mut vm, "p", "state"), HostValue::Text("pending".into()));
        assert_eq!(bridge.stats().diverted, 1);
    }

    #[test]
    fn test_list_results_rejected_through_failure_path() {
        let bridge = AsyncBridge::new(scheduler());
        let mut vm = promise_vm();
        let p = new_promise(&mut vm, "p");

        bridge.begin(p).unwrap().resolve(HostValue::List(vec![HostValue::Null]));
        bridge.pump(&mut vm);
        assert_eq!(read(&mut vm, "p", "state"), HostValue::Text("rejected".into()));
        assert_eq!(read(&mut vm, "p", "settleCount"), HostValue::Num(1.0));
    }

    #[test]
    fn test_torn_down_bridge_rejects_new_work() {
        let bridge = AsyncBridge::new(scheduler());
        let mut vm = promise_vm();
        let p = new_promise(&mut vm, "p");
        let q = new_promise(&mut vm, "q");

        let settler = bridge.begin(p).unwrap();
        bridge.teardown();
        assert!(matches!(bridge.begin(q), Err(AsyncError::TornDown)));
        settler.resolve(true);
        assert_eq!(bridge.pump(&mut vm).diverted, 1);
        assert_eq!(vm.handle_root_count(), 0);
    }

    #[test]
    fn test_cancel_inside_progress_callback() {
        let bridge = AsyncBridge::new(scheduler());
        let current = Rc::new(Cell::new(0));
        let cancelled = Rc::new(Cell::new(None));
        let resolved = Rc::new(Cell::new(false));

        let mut library = ScriptLibrary::new();
        library.constructor("main", "Watcher", "new()", |_| Ok(Value::Null));
        {
            let bridge = bridge.clone();
            let current = Rc::clone(&current);
            let cancelled = Rc::clone(&cancelled);
            library.method("main", "Watcher", "progress_(_)", move |_| {
                cancelled.set(Some(bridge.cancel(current.get())));
                Ok(Value::Null)
            });
        }
        {
            let resolved = Rc::clone(&resolved);
            library.method("main", "Watcher", "resolve_(_,_)", move |_| {
                resolved.set(true);
                Ok(Value::Bool(true))
            });
        }
        let mut vm = SandboxVm::new(&VmConfig::default(), Rc::new(ForeignRegistry::new()), Rc::new(library));
        assert!(vm
            .interpret("main", "class Watcher\nvar w = Watcher.new()")
            .is_success());
        vm.ensure_slots(1).unwrap();
        vm.get_variable("main", "w", 0).unwrap();
        let watcher = vm.get_slot_handle(0).unwrap();

        let settler = bridge.begin(watcher).unwrap();
        current.set(settler.id());
        settler.progress(0.5);
        settler.resolve(1.0);
        let report = bridge.pump(&mut vm);

        assert_eq!(cancelled.get(), Some(true));
        assert_eq!(report.progressed, 1);
        assert_eq!(report.resolved, 0);
        assert_eq!(report.diverted, 1);
        assert!(!resolved.get());
        assert_eq!(bridge.pending_count(), 0);
        assert!(!bridge.cancel(current.get()));
        assert_eq!(vm.handle_root_count(), 0);
        assert!(vm.handle_table().stats().is_balanced());
    }

    #[test]
    fn test_pump_defers_during_foreground_call() {
        let bridge = AsyncBridge::new(scheduler());
        let nested: Rc<Cell<Option<PumpReport>>> = Rc::new(Cell::new(None));

        let mut registry = ForeignRegistry::new();
        {
            let bridge = bridge.clone();
            let nested = Rc::clone(&nested);
            registry
                .register_method("main", "Host", true, "pumpNow()", move |vm| {
                    nested.set(Some(bridge.pump(vm)));
                    vm.set_slot_null(0)?;
                    Ok(())
                })
                .unwrap();
        }
        let mut library = ScriptLibrary::new();
        library.extend(&promise_library("main"));
        let mut vm = SandboxVm::new(&VmConfig::default(), Rc::new(registry), Rc::new(library));
        assert!(vm
            .interpret("main", "class Promise\nclass Host\nforeign static Host.pumpNow()")
            .is_success());
        let p = new_promise(&mut vm, "p");

        bridge.settle_ready(p, Ok(AsyncValue::Num(3.0))).unwrap();
        assert!(vm.interpret("main", "call Host.pumpNow()").is_success());

        let report = nested.get().expect("foreign method ran");
        assert!(report.deferred);
        assert_eq!(report.resolved, 0);
        assert!(bridge.has_queued());
        assert_eq!(bridge.stats().resolve_calls, 0);
        assert_eq!(read(&mut vm, "p", "state"), HostValue::Text("pending".into()));

        let report = bridge.pump(&mut vm);
        assert!(!report.deferred);
        assert_eq!(report.resolved, 1);
        assert_eq!(read(&mut vm, "p", "value"), HostValue::Num(3.0));
        assert_eq!(bridge.stats().resolve_calls, 1);
    }
}
