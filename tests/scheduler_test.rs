//! Integration tests for the device scheduler module.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use infermux::device::{
    CompiledProgram, CompletionCallback, DeviceInfo, DeviceRequest, RequestPayload,
    RequestStatus,
};
use infermux::error::{CoreError, Result};
use infermux::scheduler::DeviceScheduler;

type ExecutionLog = Arc<Mutex<Vec<String>>>;

/// Device whose requests complete on their own thread after a short delay.
struct AsyncRequest {
    device: String,
    log: ExecutionLog,
}

impl DeviceRequest for AsyncRequest {
    fn assign_payload(&mut self, _payload: &RequestPayload) -> Result<()> {
        Ok(())
    }

    fn start(&mut self, done: CompletionCallback) -> Result<()> {
        let device = self.device.clone();
        let log = Arc::clone(&self.log);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            log.lock().unwrap().push(device);
            done(RequestStatus::Ok);
        });
        Ok(())
    }
}

struct AsyncProgram {
    device: String,
    optimal: usize,
    log: ExecutionLog,
}

impl AsyncProgram {
    fn boxed(device: &str, optimal: usize, log: &ExecutionLog) -> Arc<dyn CompiledProgram> {
        Arc::new(Self {
            device: device.to_string(),
            optimal,
            log: Arc::clone(log),
        })
    }
}

impl CompiledProgram for AsyncProgram {
    fn device_name(&self) -> &str {
        &self.device
    }

    fn create_request(&self) -> Result<Box<dyn DeviceRequest>> {
        Ok(Box::new(AsyncRequest {
            device: self.device.clone(),
            log: Arc::clone(&self.log),
        }))
    }

    fn optimal_request_count(&self) -> Option<usize> {
        Some(self.optimal)
    }
}

/// Device that parks completion callbacks for the test to release manually.
type Parked = Arc<Mutex<Vec<(String, CompletionCallback)>>>;

struct GatedRequest {
    device: String,
    parked: Parked,
}

impl DeviceRequest for GatedRequest {
    fn assign_payload(&mut self, _payload: &RequestPayload) -> Result<()> {
        Ok(())
    }

    fn start(&mut self, done: CompletionCallback) -> Result<()> {
        self.parked.lock().unwrap().push((self.device.clone(), done));
        Ok(())
    }
}

struct GatedProgram {
    device: String,
    parked: Parked,
}

impl GatedProgram {
    fn boxed(device: &str, parked: &Parked) -> Arc<dyn CompiledProgram> {
        Arc::new(Self {
            device: device.to_string(),
            parked: Arc::clone(parked),
        })
    }
}

impl CompiledProgram for GatedProgram {
    fn device_name(&self) -> &str {
        &self.device
    }

    fn create_request(&self) -> Result<Box<dyn DeviceRequest>> {
        Ok(Box::new(GatedRequest {
            device: self.device.clone(),
            parked: Arc::clone(&self.parked),
        }))
    }

    fn optimal_request_count(&self) -> Option<usize> {
        Some(1)
    }
}

/// Device that cannot answer the optimal-request-count query.
struct MuteProgram;

impl CompiledProgram for MuteProgram {
    fn device_name(&self) -> &str {
        "MUTE"
    }

    fn create_request(&self) -> Result<Box<dyn DeviceRequest>> {
        Ok(Box::new(GatedRequest {
            device: "MUTE".into(),
            parked: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    fn optimal_request_count(&self) -> Option<usize> {
        None
    }
}

fn start_task(scheduler: &Arc<DeviceScheduler>) -> infermux::scheduler::WorkerTask {
    let scheduler = Arc::clone(scheduler);
    Box::new(move |worker| {
        let done = scheduler.completion_callback(Arc::clone(&worker));
        worker.start(done).unwrap();
    })
}

fn wait_until(deadline_ms: u64, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn info(name: &str) -> DeviceInfo {
    DeviceInfo::new(name)
}

fn info_n(name: &str, n: usize) -> DeviceInfo {
    DeviceInfo::with_concurrency(name, n).unwrap()
}

// === Construction ===

#[test]
fn empty_device_list_is_a_config_error() {
    let err = DeviceScheduler::new(Vec::new(), Vec::new()).unwrap_err();
    assert!(matches!(err, CoreError::Config(_)));
}

#[test]
fn missing_program_is_not_found() {
    let log = ExecutionLog::default();
    let err = DeviceScheduler::new(
        vec![AsyncProgram::boxed("CPU", 2, &log)],
        vec![info("CPU"), info("GPU")],
    )
    .unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

#[test]
fn missing_request_count_capability_is_fatal() {
    let err = DeviceScheduler::new(vec![Arc::new(MuteProgram)], vec![info("MUTE")])
        .unwrap_err();
    assert!(matches!(err, CoreError::Capability { .. }));
    assert!(err.is_fatal());
}

#[test]
fn duplicate_device_declaration_is_rejected() {
    let log = ExecutionLog::default();
    let err = DeviceScheduler::new(
        vec![AsyncProgram::boxed("CPU", 2, &log)],
        vec![info("CPU"), info("CPU")],
    )
    .unwrap_err();
    assert!(matches!(err, CoreError::Config(_)));
}

#[test]
fn pool_sizes_follow_override_then_native_optimum() {
    let log = ExecutionLog::default();
    let scheduler = DeviceScheduler::new(
        vec![
            AsyncProgram::boxed("CPU", 4, &log),
            AsyncProgram::boxed("GPU", 3, &log),
        ],
        vec![info_n("CPU", 2), info("GPU")],
    )
    .unwrap();
    assert_eq!(scheduler.pool_size("CPU"), Some(2));
    assert_eq!(scheduler.pool_size("GPU"), Some(3));
    assert_eq!(scheduler.optimal_request_count(), 7);
}

// === Dispatch and load balancing ===

#[test]
fn agnostic_tasks_spread_over_both_devices() {
    let log = ExecutionLog::default();
    let scheduler = Arc::new(
        DeviceScheduler::new(
            vec![
                AsyncProgram::boxed("CPU", 2, &log),
                AsyncProgram::boxed("GPU", 1, &log),
            ],
            vec![info_n("CPU", 2), info_n("GPU", 1)],
        )
        .unwrap(),
    );

    for _ in 0..5 {
        scheduler.dispatch(None, start_task(&scheduler)).unwrap();
    }
    wait_until(5000, || log.lock().unwrap().len() == 5);

    let log = log.lock().unwrap();
    let cpu = log.iter().filter(|d| d.as_str() == "CPU").count();
    let gpu = log.iter().filter(|d| d.as_str() == "GPU").count();
    assert_eq!(cpu + gpu, 5);
    // Three workers exist; with five tasks both devices must contribute.
    assert!(cpu >= 2, "CPU handled {cpu} of 5");
    assert!(gpu >= 1, "GPU handled {gpu} of 5");
}

#[test]
fn pool_size_invariant_holds_after_the_burst() {
    let log = ExecutionLog::default();
    let scheduler = Arc::new(
        DeviceScheduler::new(
            vec![AsyncProgram::boxed("CPU", 2, &log)],
            vec![info("CPU")],
        )
        .unwrap(),
    );
    for _ in 0..8 {
        scheduler.dispatch(None, start_task(&scheduler)).unwrap();
    }
    wait_until(5000, || log.lock().unwrap().len() == 8);
    wait_until(5000, || scheduler.idle_workers("CPU") == Some(2));
    assert_eq!(scheduler.busy_workers("CPU"), Some(0));
    assert_eq!(scheduler.pending_tasks("CPU"), Some(0));
    assert_eq!(scheduler.pending_global_tasks(), 0);
}

#[test]
fn preferred_tasks_wait_for_their_device() {
    let parked = Parked::default();
    let log = ExecutionLog::default();
    let scheduler = Arc::new(
        DeviceScheduler::new(
            vec![
                AsyncProgram::boxed("CPU", 1, &log),
                GatedProgram::boxed("GPU", &parked),
            ],
            vec![info("CPU"), info("GPU")],
        )
        .unwrap(),
    );

    // Occupy GPU's single worker, then target GPU again.
    scheduler.dispatch(Some("GPU"), start_task(&scheduler)).unwrap();
    scheduler.dispatch(Some("GPU"), start_task(&scheduler)).unwrap();
    assert_eq!(scheduler.pending_tasks("GPU"), Some(1));
    // CPU is idle but must not take GPU-targeted work.
    assert_eq!(scheduler.busy_workers("CPU"), Some(0));

    let (_, done) = parked.lock().unwrap().pop().unwrap();
    done(RequestStatus::Ok);
    wait_until(5000, || scheduler.pending_tasks("GPU") == Some(0));

    let (_, done) = parked.lock().unwrap().pop().unwrap();
    done(RequestStatus::Ok);
    wait_until(5000, || scheduler.idle_workers("GPU") == Some(1));
}

#[test]
fn device_specific_work_precedes_global_work_on_a_freed_worker() {
    let parked = Parked::default();
    let order = Arc::new(Mutex::new(Vec::new()));
    let scheduler = Arc::new(
        DeviceScheduler::new(
            vec![GatedProgram::boxed("GPU", &parked)],
            vec![info("GPU")],
        )
        .unwrap(),
    );

    let tagged_task = |tag: &'static str| -> infermux::scheduler::WorkerTask {
        let scheduler = Arc::clone(&scheduler);
        let order = Arc::clone(&order);
        Box::new(move |worker| {
            order.lock().unwrap().push(tag);
            let done = scheduler.completion_callback(Arc::clone(&worker));
            worker.start(done).unwrap();
        })
    };

    // Occupy GPU's single worker, then queue a global task first and a
    // GPU-specific task second.
    scheduler.dispatch(Some("GPU"), tagged_task("warmup")).unwrap();
    scheduler.dispatch(None, tagged_task("global")).unwrap();
    scheduler.dispatch(Some("GPU"), tagged_task("device-specific")).unwrap();
    assert_eq!(scheduler.pending_global_tasks(), 1);
    assert_eq!(scheduler.pending_tasks("GPU"), Some(1));

    // Freeing the worker must hand it to the device-specific task even
    // though the global one arrived earlier.
    let (_, done) = parked.lock().unwrap().remove(0);
    done(RequestStatus::Ok);
    assert_eq!(
        *order.lock().unwrap(),
        vec!["warmup", "device-specific"]
    );

    let (_, done) = parked.lock().unwrap().remove(0);
    done(RequestStatus::Ok);
    assert_eq!(
        *order.lock().unwrap(),
        vec!["warmup", "device-specific", "global"]
    );
    let (_, done) = parked.lock().unwrap().remove(0);
    done(RequestStatus::Ok);
    wait_until(5000, || scheduler.idle_workers("GPU") == Some(1));
}

#[test]
fn unknown_preferred_device_is_not_found() {
    let log = ExecutionLog::default();
    let scheduler = Arc::new(
        DeviceScheduler::new(
            vec![AsyncProgram::boxed("CPU", 1, &log)],
            vec![info("CPU")],
        )
        .unwrap(),
    );
    let err = scheduler
        .dispatch(Some("NPU"), Box::new(|_| {}))
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

// === Runtime priority changes ===

#[test]
fn removed_device_keeps_in_flight_work_but_gets_no_new_work() {
    let parked = Parked::default();
    let scheduler = Arc::new(
        DeviceScheduler::new(
            vec![
                GatedProgram::boxed("A", &parked),
                GatedProgram::boxed("B", &parked),
            ],
            vec![info("A"), info("B")],
        )
        .unwrap(),
    );

    // A takes the first agnostic task and holds it.
    scheduler.dispatch(None, start_task(&scheduler)).unwrap();
    assert_eq!(scheduler.busy_workers("A"), Some(1));

    scheduler.set_device_priorities(vec![info("B")]).unwrap();

    // New agnostic work lands on B only.
    scheduler.dispatch(None, start_task(&scheduler)).unwrap();
    assert_eq!(scheduler.busy_workers("B"), Some(1));

    // Release A's in-flight request; it completes normally and the worker
    // returns to an idle pool that the scan no longer visits.
    let (device, done) = parked.lock().unwrap().remove(0);
    assert_eq!(device, "A");
    done(RequestStatus::Ok);
    wait_until(5000, || scheduler.idle_workers("A") == Some(1));

    scheduler.dispatch(None, start_task(&scheduler)).unwrap();
    assert_eq!(scheduler.busy_workers("A"), Some(0));
    assert_eq!(scheduler.pending_global_tasks(), 1);

    let (_, done) = parked.lock().unwrap().remove(0);
    done(RequestStatus::Ok);
    wait_until(5000, || scheduler.pending_global_tasks() == 0);
    let (_, done) = parked.lock().unwrap().remove(0);
    done(RequestStatus::Ok);
    wait_until(5000, || scheduler.idle_workers("B") == Some(1));
}

#[test]
fn priority_update_with_unknown_device_keeps_prior_list() {
    let log = ExecutionLog::default();
    let scheduler = DeviceScheduler::new(
        vec![AsyncProgram::boxed("CPU", 1, &log)],
        vec![info("CPU")],
    )
    .unwrap();
    let err = scheduler
        .set_device_priorities(vec![info("CPU"), info("NPU")])
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
    assert_eq!(scheduler.device_priorities().len(), 1);
    assert_eq!(scheduler.device_priorities()[0].name, "CPU");
}

#[test]
fn priority_update_cannot_change_request_counts() {
    let log = ExecutionLog::default();
    let scheduler = DeviceScheduler::new(
        vec![AsyncProgram::boxed("CPU", 1, &log)],
        vec![info("CPU")],
    )
    .unwrap();
    let err = scheduler
        .set_device_priorities(vec![info_n("CPU", 4)])
        .unwrap_err();
    assert!(matches!(err, CoreError::NotImplemented(_)));
    assert_eq!(scheduler.pool_size("CPU"), Some(1));
}

// === Teardown ===

#[test]
fn dispatch_after_shutdown_drops_the_task() {
    let log = ExecutionLog::default();
    let scheduler = Arc::new(
        DeviceScheduler::new(
            vec![AsyncProgram::boxed("CPU", 1, &log)],
            vec![info("CPU")],
        )
        .unwrap(),
    );
    scheduler.shutdown();
    assert!(scheduler.is_terminating());
    scheduler.dispatch(None, start_task(&scheduler)).unwrap();
    assert_eq!(scheduler.pending_global_tasks(), 0);
    assert!(log.lock().unwrap().is_empty());
}

// === Performance counters ===

struct CountersRequest;

impl DeviceRequest for CountersRequest {
    fn assign_payload(&mut self, _payload: &RequestPayload) -> Result<()> {
        Ok(())
    }

    fn start(&mut self, done: CompletionCallback) -> Result<()> {
        std::thread::spawn(move || done(RequestStatus::Ok));
        Ok(())
    }

    fn performance_counters(&self) -> HashMap<String, u64> {
        HashMap::from([("exec_us".to_string(), 42u64)])
    }
}

struct CountersProgram;

impl CompiledProgram for CountersProgram {
    fn device_name(&self) -> &str {
        "CPU"
    }

    fn create_request(&self) -> Result<Box<dyn DeviceRequest>> {
        Ok(Box::new(CountersRequest))
    }

    fn optimal_request_count(&self) -> Option<usize> {
        Some(1)
    }
}

#[test]
fn worker_exposes_device_performance_counters() {
    let scheduler = Arc::new(
        DeviceScheduler::new(vec![Arc::new(CountersProgram)], vec![info("CPU")]).unwrap(),
    );
    let counters = Arc::new(Mutex::new(HashMap::new()));
    let captured = Arc::clone(&counters);
    scheduler
        .dispatch(
            None,
            Box::new(move |worker| {
                *captured.lock().unwrap() = worker.performance_counters();
            }),
        )
        .unwrap();
    assert_eq!(counters.lock().unwrap().get("exec_us"), Some(&42));
}
