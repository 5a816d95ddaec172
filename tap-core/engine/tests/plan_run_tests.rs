//! 测试计划运行集成测试

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tap_engine::*;
use tap_threading::{PoolConfig, ThreadPool};
use uuid::Uuid;

fn test_executor(config: EngineConfig) -> TestPlanExecutor {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
    TestPlanExecutor::new(
        config.with_pool(PoolConfig::default().with_idle_floor(4).with_soft_cap(32)),
    )
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "等待条件超时");
        thread::sleep(Duration::from_millis(5));
    }
}

/// 记录所有事件的监听器
struct RecordingListener {
    name: String,
    events: Mutex<Vec<String>>,
    fail_on_publish: bool,
    publish_delay: Duration,
    closed: AtomicBool,
    scheduled: AtomicUsize,
}

impl RecordingListener {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, false, Duration::ZERO))
    }

    fn faulty(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, true, Duration::ZERO))
    }

    fn slow(name: &str, publish_delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(name, false, publish_delay))
    }

    fn build(name: &str, fail_on_publish: bool, publish_delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            events: Mutex::new(Vec::new()),
            fail_on_publish,
            publish_delay,
            closed: AtomicBool::new(false),
            scheduled: AtomicUsize::new(0),
        }
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn count_prefix(&self, prefix: &str) -> usize {
        self.events.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn position(&self, event: &str) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }
}

impl ResultListener for RecordingListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_test_plan_run_start(&self, _run: &PlanRunInfo) -> anyhow::Result<()> {
        self.events.lock().push("plan_start".to_string());
        Ok(())
    }

    fn on_test_plan_run_completed(&self, run: &PlanRunInfo, _log: &LogView) -> anyhow::Result<()> {
        self.events.lock().push(format!("plan_completed:{}", run.verdict));
        Ok(())
    }

    fn on_test_step_run_start(&self, step_run: &StepRunInfo) -> anyhow::Result<()> {
        self.events.lock().push(format!("step_start:{}", step_run.step_name));
        Ok(())
    }

    fn on_test_step_run_completed(&self, step_run: &StepRunInfo) -> anyhow::Result<()> {
        self.events.lock().push(format!(
            "step_completed:{}:{}",
            step_run.step_name, step_run.verdict
        ));
        Ok(())
    }

    fn on_result_published(&self, _step_run_id: Uuid, table: &ResultTable) -> anyhow::Result<()> {
        if !self.publish_delay.is_zero() {
            thread::sleep(self.publish_delay);
        }
        self.events.lock().push(format!("result:{}", table.name));
        if self.fail_on_publish {
            anyhow::bail!("结果写入失败");
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 前 `fail_times` 次判定 Fail，之后 Pass
struct FlakyStep {
    attempts: Arc<AtomicUsize>,
    fail_times: usize,
}

impl TestStep for FlakyStep {
    fn type_name(&self) -> &str {
        "flaky"
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_times {
            ctx.upgrade_verdict(Verdict::Fail);
        } else {
            ctx.upgrade_verdict(Verdict::Pass);
        }
        Ok(())
    }
}

/// 在延后处理中休眠后设置判定
struct DeferringStep {
    delay: Duration,
    verdict: Verdict,
}

impl TestStep for DeferringStep {
    fn type_name(&self) -> &str {
        "deferring"
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
        let delay = self.delay;
        let verdict = self.verdict;
        ctx.defer(move |deferred| {
            deferred.sleep(delay)?;
            deferred.upgrade_verdict(verdict);
            Ok(())
        });
        Ok(())
    }
}

struct PublishManyStep {
    count: usize,
    pause: Duration,
}

impl TestStep for PublishManyStep {
    fn type_name(&self) -> &str {
        "publish_many"
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
        for i in 0..self.count {
            ctx.publish(ResultTable::new(format!("t{}", i)).with_column("value", vec![i as u64]))?;
            if !self.pause.is_zero() {
                thread::sleep(self.pause);
            }
        }
        ctx.upgrade_verdict(Verdict::Pass);
        Ok(())
    }
}

struct SchedulingStep {
    listener: Arc<RecordingListener>,
}

impl TestStep for SchedulingStep {
    fn type_name(&self) -> &str {
        "scheduling"
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
        ctx.plan_run()
            .schedule_in_result_processing_thread::<RecordingListener, _>(
                |listener| {
                    thread::sleep(Duration::from_millis(50));
                    listener.scheduled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                true,
            );
        if self.listener.scheduled.load(Ordering::SeqCst) == 1 {
            ctx.upgrade_verdict(Verdict::Pass);
        } else {
            ctx.upgrade_verdict(Verdict::Fail);
        }
        Ok(())
    }
}

/// 发布后等待所有监听器处理完毕，再检查结果是否已被记录
struct PublishAndWaitStep {
    listener: Arc<RecordingListener>,
}

impl TestStep for PublishAndWaitStep {
    fn type_name(&self) -> &str {
        "publish_and_wait"
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
        ctx.publish(ResultTable::new("sync"))?;
        ctx.plan_run().wait_for_results();
        if self.listener.count_prefix("result:sync") == 1 {
            ctx.upgrade_verdict(Verdict::Pass);
        } else {
            ctx.upgrade_verdict(Verdict::Fail);
        }
        Ok(())
    }
}

/// 集中发布一批结果，待慢监听器产生耗时样本后显式节流，记录节流结束时刻与等待时长
struct BurstThenThrottleStep {
    count: usize,
    settle: Duration,
    throttled: Arc<Mutex<Option<(Instant, Duration)>>>,
}

impl TestStep for BurstThenThrottleStep {
    fn type_name(&self) -> &str {
        "burst_then_throttle"
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
        for i in 0..self.count {
            ctx.publish(ResultTable::new(format!("b{}", i)))?;
        }
        thread::sleep(self.settle);

        let started = Instant::now();
        let outcome = ctx.plan_run().throttle_result_propagation();
        *self.throttled.lock() = Some((Instant::now(), started.elapsed()));
        outcome?;

        ctx.upgrade_verdict(Verdict::Pass);
        Ok(())
    }
}

struct PanicStep;

impl TestStep for PanicStep {
    fn type_name(&self) -> &str {
        "panic"
    }

    fn run(&self, _ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
        panic!("仪器驱动崩溃");
    }
}

struct FakeResource {
    name: String,
    fail: bool,
    closed: AtomicBool,
}

impl Resource for FakeResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> anyhow::Result<()> {
        thread::sleep(Duration::from_millis(10));
        if self.fail {
            anyhow::bail!("设备无响应");
        }
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn metadata(&self) -> Vec<(String, String)> {
        vec![(format!("{}.serial", self.name), "SN-42".to_string())]
    }
}

/// 使用资源并检查元数据已写入计划参数
struct ResourceStep {
    resource: Arc<FakeResource>,
}

impl TestStep for ResourceStep {
    fn type_name(&self) -> &str {
        "resource"
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
        let key = format!("{}.serial", self.resource.name);
        match ctx.parameter(&key) {
            Some(_) => ctx.upgrade_verdict(Verdict::Pass),
            None => ctx.upgrade_verdict(Verdict::Fail),
        };
        Ok(())
    }

    fn resources(&self) -> Vec<Arc<dyn Resource>> {
        vec![self.resource.clone() as Arc<dyn Resource>]
    }
}

fn verdict_step(name: &str, verdict: Verdict) -> StepNode {
    StepNode::new(name, SetVerdictStep::new(verdict))
}

#[test]
fn test_break_on_fail_with_two_listeners() {
    let first = RecordingListener::new("first");
    let second = RecordingListener::new("second");
    let executor = test_executor(EngineConfig::default())
        .with_listener(first.clone())
        .with_listener(second.clone());

    let plan = TestPlan::new("break-on-fail")
        .with_break_conditions(BreakCondition::BREAK_ON_FAIL)
        .with_step(verdict_step("failing", Verdict::Fail))
        .with_step(verdict_step("skipped", Verdict::Pass));

    let report = executor.execute(Arc::new(plan)).unwrap();

    assert!(report.verdict() >= Verdict::Fail);
    assert!(!report.passed());
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].step_name, "failing");

    for listener in [&first, &second] {
        assert_eq!(
            listener.events(),
            vec![
                "plan_start".to_string(),
                "step_start:failing".to_string(),
                "step_completed:failing:Fail".to_string(),
                "plan_completed:Fail".to_string(),
            ]
        );
    }
    executor.shutdown();
}

#[test]
fn test_plan_verdict_is_maximum_of_steps() {
    let executor = test_executor(EngineConfig::default());
    let plan = TestPlan::new("aggregate")
        .with_step(verdict_step("pass", Verdict::Pass))
        .with_step(verdict_step("inconclusive", Verdict::Inconclusive))
        .with_step(verdict_step("unset", Verdict::NotSet));

    let report = executor.execute(Arc::new(plan)).unwrap();

    assert_eq!(report.verdict(), Verdict::Pass);
    assert_eq!(report.steps.len(), 3);
    assert_eq!(report.count(Verdict::Pass), 1);
    assert_eq!(report.count(Verdict::Inconclusive), 1);
    assert_eq!(report.count(Verdict::NotSet), 1);
    assert!(report.steps.iter().all(|s| s.duration_ms.is_some()));
    executor.shutdown();
}

#[test]
fn test_step_error_breaks_by_default() {
    let executor = test_executor(EngineConfig::default());
    let plan = TestPlan::new("error")
        .with_step(StepNode::new("boom", FailStep::new("电源未上电")))
        .with_step(verdict_step("after", Verdict::Pass));

    let report = executor.execute(Arc::new(plan)).unwrap();

    assert_eq!(report.verdict(), Verdict::Error);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].verdict, Verdict::Error);
    assert!(report.steps[0]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("电源未上电")));
    assert!(report.log.contains("电源未上电"));
    executor.shutdown();
}

#[test]
fn test_step_panic_becomes_error() {
    let executor = test_executor(
        EngineConfig::default().with_break_conditions(BreakCondition::NONE),
    );
    let plan = TestPlan::new("panic")
        .with_step(StepNode::new("crash", PanicStep))
        .with_step(verdict_step("after", Verdict::Pass));

    let report = executor.execute(Arc::new(plan)).unwrap();

    assert_eq!(report.verdict(), Verdict::Error);
    assert_eq!(report.steps.len(), 2);
    assert!(report.steps[0]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("仪器驱动崩溃")));
    assert_eq!(report.steps[1].verdict, Verdict::Pass);
    executor.shutdown();
}

#[test]
fn test_break_conditions_inherit_from_plan() {
    let executor = test_executor(EngineConfig::default());
    let plan = TestPlan::new("inherit")
        .with_break_conditions(BreakCondition::BREAK_ON_FAIL)
        .with_step(
            StepNode::new("outer", SequenceStep)
                .with_child(verdict_step("inner-fail", Verdict::Fail))
                .with_child(verdict_step("inner-skipped", Verdict::Pass)),
        )
        .with_step(verdict_step("root-skipped", Verdict::Pass));

    let report = executor.execute(Arc::new(plan)).unwrap();

    let names: Vec<&str> = report.steps.iter().map(|s| s.step_name.as_str()).collect();
    assert_eq!(names, vec!["outer", "inner-fail"]);
    assert_eq!(report.steps[0].verdict, Verdict::Fail);
    assert_eq!(report.steps[0].break_conditions, BreakCondition::BREAK_ON_FAIL);
    assert_eq!(report.steps[1].parent, report.steps[0].id);
    assert_eq!(report.verdict(), Verdict::Fail);
    executor.shutdown();
}

#[test]
fn test_explicit_conditions_override_inheritance() {
    let executor = test_executor(EngineConfig::default());
    let plan = TestPlan::new("override")
        .with_break_conditions(BreakCondition::BREAK_ON_FAIL)
        .with_step(
            StepNode::new("tolerant", SequenceStep)
                .with_break_conditions(BreakCondition::NONE)
                .with_child(verdict_step("child-fail", Verdict::Fail))
                .with_child(verdict_step("child-pass", Verdict::Pass)),
        )
        .with_step(verdict_step("after", Verdict::Pass));

    let report = executor.execute(Arc::new(plan)).unwrap();

    let names: Vec<&str> = report.steps.iter().map(|s| s.step_name.as_str()).collect();
    assert_eq!(names, vec!["tolerant", "child-fail", "child-pass", "after"]);
    assert_eq!(report.steps[0].verdict, Verdict::Fail);
    assert_eq!(report.verdict(), Verdict::Fail);
    executor.shutdown();
}

#[test]
fn test_disabled_steps_are_skipped() {
    let executor = test_executor(EngineConfig::default());
    let plan = TestPlan::new("disabled")
        .with_step(verdict_step("off", Verdict::Fail).with_enabled(false))
        .with_step(verdict_step("on", Verdict::Pass));

    let report = executor.execute(Arc::new(plan)).unwrap();

    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].step_name, "on");
    assert_eq!(report.verdict(), Verdict::Pass);
    executor.shutdown();
}

#[test]
fn test_retry_until_pass() {
    let executor = test_executor(EngineConfig::default());
    let attempts = Arc::new(AtomicUsize::new(0));
    let plan = TestPlan::new("retry").with_step(
        StepNode::new(
            "flaky",
            FlakyStep {
                attempts: Arc::clone(&attempts),
                fail_times: 1,
            },
        )
        .with_break_conditions(BreakCondition::BREAK_ON_FAIL)
        .with_retries(2),
    );

    let report = executor.execute(Arc::new(plan)).unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(report.steps.len(), 2);
    assert_eq!(report.steps[0].attempt, 0);
    assert_eq!(report.steps[0].verdict, Verdict::Fail);
    assert_eq!(report.steps[1].attempt, 1);
    assert_eq!(report.steps[1].verdict, Verdict::Pass);
    assert!(!report.steps[1].out_of_retries);
    // 只有最后一次尝试的判定上报给计划
    assert_eq!(report.verdict(), Verdict::Pass);
    executor.shutdown();
}

#[test]
fn test_retry_exhaustion_sets_out_of_retries() {
    let executor = test_executor(EngineConfig::default());
    let attempts = Arc::new(AtomicUsize::new(0));
    let plan = TestPlan::new("exhausted")
        .with_step(
            StepNode::new(
                "broken",
                FlakyStep {
                    attempts: Arc::clone(&attempts),
                    fail_times: usize::MAX,
                },
            )
            .with_break_conditions(BreakCondition::BREAK_ON_FAIL)
            .with_retries(2),
        )
        .with_step(verdict_step("skipped", Verdict::Pass));

    let report = executor.execute(Arc::new(plan)).unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(report.steps.len(), 3);
    assert!(report.steps[..2].iter().all(|s| !s.out_of_retries));
    assert!(report.steps[2].out_of_retries);
    assert_eq!(report.verdict(), Verdict::Fail);
    executor.shutdown();
}

#[test]
fn test_abort_running_plan() {
    let listener = RecordingListener::new("recorder");
    let executor = test_executor(EngineConfig::default()).with_listener(listener.clone());
    let plan = TestPlan::new("abort")
        .with_step(StepNode::new("long", DelayStep::new(Duration::from_secs(30))))
        .with_step(verdict_step("never", Verdict::Pass));

    let handle = executor.start(Arc::new(plan));
    wait_until(|| !handle.run().step_runs().is_empty());
    handle.abort(Some("操作员中止")).unwrap();

    let started = Instant::now();
    let report = handle.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.verdict(), Verdict::Aborted);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].verdict, Verdict::Aborted);
    assert!(report.log.contains("操作员中止"));
    assert_eq!(listener.position("plan_completed:Aborted"), Some(listener.events().len() - 1));
    executor.shutdown();
}

#[test]
fn test_deferred_step_does_not_block_siblings() {
    let listener = RecordingListener::new("recorder");
    let executor = test_executor(EngineConfig::default()).with_listener(listener.clone());
    let plan = TestPlan::new("deferred")
        .with_break_conditions(BreakCondition::BREAK_ON_FAIL)
        .with_step(StepNode::new(
            "deferred",
            DeferringStep {
                delay: Duration::from_millis(200),
                verdict: Verdict::Fail,
            },
        ))
        .with_step(verdict_step("sibling", Verdict::Pass));

    let report = executor.execute(Arc::new(plan)).unwrap();

    let deferred = &report.steps[0];
    assert!(deferred.was_deferred);
    assert_eq!(deferred.verdict, Verdict::Fail);
    assert!(deferred.duration_ms.is_some_and(|ms| ms >= 200));
    assert_eq!(report.steps[1].step_name, "sibling");

    let sibling_started = listener.position("step_start:sibling").unwrap();
    let deferred_completed = listener.position("step_completed:deferred:Fail").unwrap();
    assert!(sibling_started < deferred_completed);

    // 延后步骤的判定在父级等待后才生效
    assert_eq!(report.verdict(), Verdict::Fail);
    executor.shutdown();
}

#[test]
fn test_deferred_publish_reaches_listeners() {
    let listener = RecordingListener::new("recorder");
    let executor = test_executor(EngineConfig::default()).with_listener(listener.clone());
    let table = ResultTable::new("power").with_column("watts", vec![1.5, 1.7]);
    let plan = TestPlan::new("deferred-publish")
        .with_step(StepNode::new("publish", PublishResultsStep::new(table).deferred()));

    let report = executor.execute(Arc::new(plan)).unwrap();

    assert!(report.steps[0].was_deferred);
    assert_eq!(report.verdict(), Verdict::Pass);
    assert_eq!(listener.count_prefix("result:power"), 1);
    executor.shutdown();
}

#[test]
fn test_faulty_listener_is_isolated() {
    let faulty = RecordingListener::faulty("faulty");
    let healthy = RecordingListener::new("healthy");
    let executor = test_executor(EngineConfig::default())
        .with_listener(faulty.clone())
        .with_listener(healthy.clone());

    let plan = TestPlan::new("isolation")
        .with_step(StepNode::new("publisher", PublishManyStep {
                count: 3,
                pause: Duration::ZERO,
            }))
        .with_step(verdict_step("after", Verdict::Pass));

    let handle = executor.start(Arc::new(plan));
    let run = Arc::clone(handle.run());
    let report = handle.join().unwrap();

    assert_eq!(report.verdict(), Verdict::Pass);
    assert_eq!(faulty.count_prefix("result:"), 1);
    assert!(faulty.closed.load(Ordering::SeqCst));
    assert_eq!(faulty.count_prefix("plan_completed"), 0);

    assert_eq!(healthy.count_prefix("result:"), 3);
    assert_eq!(healthy.count_prefix("step_completed:after"), 1);
    assert_eq!(healthy.count_prefix("plan_completed:Pass"), 1);
    assert!(!healthy.closed.load(Ordering::SeqCst));

    assert_eq!(run.active_listeners(), vec!["healthy".to_string()]);
    executor.shutdown();
}

#[test]
fn test_blocking_schedule_waits_for_matching_listeners() {
    let recorder = RecordingListener::new("recorder");
    let executor = test_executor(EngineConfig::default())
        .with_listener(Arc::new(LogListener::new()))
        .with_listener(recorder.clone());
    let plan = TestPlan::new("schedule").with_step(StepNode::new(
        "schedule",
        SchedulingStep {
            listener: recorder.clone(),
        },
    ));

    let report = executor.execute(Arc::new(plan)).unwrap();

    assert_eq!(report.verdict(), Verdict::Pass);
    assert_eq!(recorder.scheduled.load(Ordering::SeqCst), 1);
    executor.shutdown();
}

#[test]
fn test_wait_for_results_drains_listener_queues() {
    let slow = RecordingListener::slow("slow", Duration::from_millis(50));
    let executor = test_executor(EngineConfig::default()).with_listener(slow.clone());
    let plan = TestPlan::new("wait-results").with_step(StepNode::new(
        "publish-and-wait",
        PublishAndWaitStep {
            listener: slow.clone(),
        },
    ));

    let report = executor.execute(Arc::new(plan)).unwrap();

    assert_eq!(report.verdict(), Verdict::Pass);
    assert_eq!(slow.count_prefix("result:sync"), 1);
    executor.shutdown();
}

#[test]
fn test_slow_listener_throttles_publisher() {
    let slow = RecordingListener::slow("slow", Duration::from_millis(20));
    let executor = test_executor(
        EngineConfig::default().with_result_latency_limit(Duration::from_millis(10)),
    )
    .with_listener(slow.clone());
    let plan = TestPlan::new("throttle").with_step(StepNode::new(
        "burst",
        PublishManyStep {
            count: 15,
            pause: Duration::from_millis(5),
        },
    ));

    let report = executor.execute(Arc::new(plan)).unwrap();

    assert_eq!(slow.count_prefix("result:"), 15);
    // 生产者被反压，步骤耗时接近监听器的处理总时长
    assert!(report.steps[0].duration_ms.is_some_and(|ms| ms >= 150));
    executor.shutdown();
}

#[test]
fn test_throttle_waits_until_depth_one_and_warns_once() {
    let slow = RecordingListener::slow("slow", Duration::from_millis(50));
    let executor = test_executor(
        EngineConfig::default().with_result_latency_limit(Duration::from_millis(10)),
    )
    .with_listener(slow.clone());
    let throttled = Arc::new(Mutex::new(None));
    let plan = TestPlan::new("throttle-window").with_step(StepNode::new(
        "burst",
        BurstThenThrottleStep {
            count: 6,
            settle: Duration::from_millis(60),
            throttled: Arc::clone(&throttled),
        },
    ));

    let report = executor.execute(Arc::new(plan)).unwrap();

    assert_eq!(report.verdict(), Verdict::Pass);
    assert_eq!(slow.count_prefix("result:"), 6);
    // 积压约 5 项，每项 50ms，应在深度降到 1 时返回而不是等到全部清空
    let recorded = *throttled.lock();
    let (_, waited) = recorded.expect("节流未执行");
    assert!(waited >= Duration::from_millis(100), "节流等待过短: {:?}", waited);
    assert!(waited <= Duration::from_millis(600), "节流等待过长: {:?}", waited);

    let warnings = report
        .log
        .at_level(LogLevel::Warn)
        .filter(|entry| entry.message.contains("处理缓慢"))
        .count();
    assert_eq!(warnings, 1);
    executor.shutdown();
}

#[test]
fn test_abort_interrupts_throttled_publisher() {
    let slow = RecordingListener::slow("slow", Duration::from_millis(200));
    let executor = test_executor(
        EngineConfig::default().with_result_latency_limit(Duration::from_millis(10)),
    )
    .with_listener(slow.clone());
    let throttled = Arc::new(Mutex::new(None));
    let plan = TestPlan::new("throttle-abort")
        .with_step(StepNode::new(
            "burst",
            BurstThenThrottleStep {
                count: 10,
                settle: Duration::from_millis(250),
                throttled: Arc::clone(&throttled),
            },
        ))
        .with_step(verdict_step("never", Verdict::Pass));

    let handle = executor.start(Arc::new(plan));
    wait_until(|| !handle.run().step_runs().is_empty());
    thread::sleep(Duration::from_millis(450));
    let aborted_at = Instant::now();
    handle.abort(Some("节流中止")).unwrap();

    let report = handle.join().unwrap();

    let recorded = *throttled.lock();
    let (finished_at, _) = recorded.expect("节流未执行");
    let delay = finished_at.saturating_duration_since(aborted_at);
    assert!(delay < Duration::from_millis(500), "节流在中止后 {:?} 才返回", delay);
    assert_eq!(report.verdict(), Verdict::Aborted);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].verdict, Verdict::Aborted);
    // 已入队的结果仍全部投递
    assert_eq!(slow.count_prefix("result:"), 10);
    executor.shutdown();
}

#[test]
fn test_dropping_executor_shuts_down_owned_pool() {
    let executor = test_executor(EngineConfig::default());
    let owned = executor.pool().clone();
    let plan = TestPlan::new("drop").with_step(verdict_step("pass", Verdict::Pass));
    assert!(executor.execute(Arc::new(plan)).unwrap().passed());
    drop(executor);
    assert!(owned.is_shutdown());

    let external = ThreadPool::new(PoolConfig::default().with_idle_floor(2).with_soft_cap(8));
    let executor = test_executor(EngineConfig::default()).with_pool(external.clone());
    let plan = TestPlan::new("drop-external").with_step(verdict_step("pass", Verdict::Pass));
    assert!(executor.execute(Arc::new(plan)).unwrap().passed());
    drop(executor);
    assert!(!external.is_shutdown());
    external.shutdown();
}

#[test]
fn test_resource_metadata_becomes_parameters() {
    let resource = Arc::new(FakeResource {
        name: "dut".to_string(),
        fail: false,
        closed: AtomicBool::new(false),
    });
    let executor = test_executor(EngineConfig::default());
    let plan = TestPlan::new("resources").with_step(StepNode::new(
        "uses-dut",
        ResourceStep {
            resource: Arc::clone(&resource),
        },
    ));

    let report = executor.execute(Arc::new(plan)).unwrap();

    assert_eq!(report.verdict(), Verdict::Pass);
    assert_eq!(report.run.parameters.get("dut.serial").map(String::as_str), Some("SN-42"));
    assert_eq!(report.run.parameters.get("plan_name").map(String::as_str), Some("resources"));
    assert!(resource.closed.load(Ordering::SeqCst));
    executor.shutdown();
}

#[test]
fn test_resource_failure_skips_steps() {
    let resource = Arc::new(FakeResource {
        name: "scope".to_string(),
        fail: true,
        closed: AtomicBool::new(false),
    });
    let executor = test_executor(EngineConfig::default());
    let plan = TestPlan::new("broken-resource").with_step(StepNode::new(
        "uses-scope",
        ResourceStep { resource },
    ));

    let report = executor.execute(Arc::new(plan)).unwrap();

    assert_eq!(report.verdict(), Verdict::Error);
    assert!(report.steps.is_empty());
    assert!(report.log.contains("设备无响应"));
    executor.shutdown();
}

#[test]
fn test_report_export_and_plan_snapshot() {
    let executor = test_executor(EngineConfig::default());
    let plan = TestPlan::new("export")
        .with_step(StepNode::new("seq", SequenceStep).with_child(verdict_step("leaf", Verdict::Pass)));

    let handle = executor.start(Arc::new(plan));
    let run = Arc::clone(handle.run());
    let report = handle.join().unwrap();

    let json = report.to_json().unwrap();
    assert!(json.contains("\"verdict\": \"pass\""));
    let yaml = report.to_yaml().unwrap();
    assert!(yaml.contains("plan_name: export"));

    let snapshot = JsonPlanSerializer::new()
        .deserialize(&mut run.serialized_plan().unwrap())
        .unwrap();
    assert_eq!(snapshot.name, "export");
    assert_eq!(snapshot.steps[0].children[0].type_name, "verdict");
    executor.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_for_run_asynchronously() {
    let executor = test_executor(EngineConfig::default());
    let plan = TestPlan::new("async")
        .with_step(StepNode::new("delay", DelayStep::new(Duration::from_millis(20))))
        .with_step(verdict_step("pass", Verdict::Pass));

    let report = executor.start(Arc::new(plan)).wait().await.unwrap();

    assert_eq!(report.verdict(), Verdict::Pass);
    assert_eq!(report.steps.len(), 2);
    executor.shutdown();
}
