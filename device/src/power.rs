use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use crate::context::DeviceContext;
use crate::hal::{PowerHal, WakeCause};
use crate::net::TEARDOWN_LOCK_TIMEOUT;
use crate::types::{PowerInstruction, PowerStatus};

pub const BUTTON_DEBOUNCE: Duration = Duration::from_millis(80);
const BUTTON_SAMPLE_EVERY: Duration = Duration::from_millis(5);
const LATCH_SETTLE: Duration = Duration::from_millis(100);
const NO_EDGE: u64 = u64::MAX;

#[derive(Debug, Default)]
struct InstructionState {
    instruction: PowerInstruction,
    pending: bool,
    ready: bool,
    report_dirty: bool,
    status: PowerStatus,
}

/// Remote power instruction and its acknowledgement. Held in memory only;
/// a reboot forgets it.
#[derive(Debug, Default)]
pub struct PowerInstructions {
    state: Mutex<InstructionState>,
}

impl PowerInstructions {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, InstructionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arms `TurnOff` pending acknowledgement. Re-arming an instruction that
    /// is already armed keeps its progress.
    pub fn apply(&self, instruction: PowerInstruction) {
        if instruction == PowerInstruction::None {
            self.clear();
            return;
        }
        let mut state = self.state();
        if state.instruction == instruction {
            return;
        }
        state.instruction = instruction;
        state.pending = true;
        state.ready = false;
        state.report_dirty = true;
        state.status = PowerStatus::Off;
        info!("Power-off instruction received, waiting for server acknowledgement");
    }

    pub fn clear(&self) {
        let mut state = self.state();
        if state.instruction != PowerInstruction::None {
            info!("Power instruction cleared");
        }
        *state = InstructionState::default();
    }

    /// A batch carrying the power status was accepted by the server.
    pub fn acknowledge(&self) {
        let mut state = self.state();
        state.report_dirty = false;
        if state.instruction == PowerInstruction::TurnOff && state.pending {
            state.pending = false;
            state.ready = true;
            info!("Power-off acknowledged by server");
        }
    }

    pub fn should_shutdown(&self) -> bool {
        let state = self.state();
        state.ready && !state.pending && state.instruction == PowerInstruction::TurnOff
    }

    pub fn instruction(&self) -> PowerInstruction {
        self.state().instruction
    }

    pub fn status(&self) -> PowerStatus {
        self.state().status
    }

    /// The server has not yet seen the current power status.
    pub fn report_pending(&self) -> bool {
        self.state().report_dirty
    }
}

/// Interrupt side of the button. `on_edge` only timestamps and signals; the
/// button task does the rest.
#[derive(Debug)]
pub struct ButtonIrq {
    epoch: Instant,
    last_edge_us: AtomicU64,
    debounce: Duration,
    notify: Notify,
}

impl ButtonIrq {
    pub fn new(debounce: Duration) -> Self {
        ButtonIrq {
            epoch: Instant::now(),
            last_edge_us: AtomicU64::new(NO_EDGE),
            debounce,
            notify: Notify::new(),
        }
    }

    pub fn on_edge(&self) -> bool {
        let now_us = self.epoch.elapsed().as_micros() as u64;
        self.on_edge_at(now_us)
    }

    /// Accepts the edge when at least one debounce interval has passed since
    /// the previous accepted one.
    pub fn on_edge_at(&self, now_us: u64) -> bool {
        let last = self.last_edge_us.load(Ordering::Acquire);
        if last != NO_EDGE && now_us.saturating_sub(last) < self.debounce.as_micros() as u64 {
            return false;
        }
        self.last_edge_us.store(now_us, Ordering::Release);
        self.notify.notify_one();
        true
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Sleeping,
    ShuttingDown,
    PoweredOff,
}

/// Which shutdown steps completed. Steps run regardless of earlier failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub gps_stopped: bool,
    pub transport_disconnected: bool,
    pub transport_powered_off: bool,
    pub gps_released: bool,
    pub storage_closed: bool,
}

pub struct PowerController {
    ctx: Arc<DeviceContext>,
    hal: Arc<dyn PowerHal>,
    button: Arc<ButtonIrq>,
    state: watch::Sender<LifecycleState>,
    shutdown_started: AtomicBool,
}

impl PowerController {
    pub fn new(ctx: Arc<DeviceContext>, hal: Arc<dyn PowerHal>) -> Arc<Self> {
        let (state, _) = watch::channel(LifecycleState::Running);
        Arc::new(PowerController {
            ctx,
            hal,
            button: Arc::new(ButtonIrq::new(BUTTON_DEBOUNCE)),
            state,
            shutdown_started: AtomicBool::new(false),
        })
    }

    pub fn hal(&self) -> &Arc<dyn PowerHal> {
        &self.hal
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Holds the power latch, lights the LED and arms the button.
    pub fn power_on(&self) {
        self.hal.set_power_latch(true);
        self.ctx.shutdown.reset();
        self.hal.set_status_led(true);
        self.hal.attach_button_interrupt(self.button.clone());
        self.state.send_replace(LifecycleState::Running);
        info!("Main power latch on");
    }

    /// Task woken by the button interrupt. A confirmed press shuts down.
    pub fn spawn_button_task(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                controller.button.wait().await;
                if controller.confirm_press().await {
                    info!("Button press detected, initiating graceful shutdown");
                    controller.graceful_shutdown().await;
                    break;
                }
            }
        })
    }

    /// Re-samples the button for one debounce window; bounces fail.
    async fn confirm_press(&self) -> bool {
        let started = time::Instant::now();
        while started.elapsed() < BUTTON_DEBOUNCE {
            if !self.hal.button_asserted() {
                break;
            }
            time::sleep(BUTTON_SAMPLE_EVERY).await;
        }
        self.hal.button_asserted()
    }

    /// Tears the device down and releases the power latch. Only the first
    /// caller runs the sequence; later callers get `None`.
    pub async fn graceful_shutdown(&self) -> Option<ShutdownReport> {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            info!("Shutdown already in progress");
            return None;
        }
        info!("Shutdown requested, starting graceful power-off");
        self.state.send_replace(LifecycleState::ShuttingDown);
        self.hal.detach_button_interrupt();
        self.ctx.shutdown.request();
        self.hal.set_status_led(false);

        let mut report = ShutdownReport::default();
        self.ctx.locator.request_abort();
        report.gps_stopped = self.ctx.locator.wait_idle().await;
        if !report.gps_stopped {
            warn!("GPS loop did not stop in time");
        }

        report.transport_disconnected = self.ctx.transport.disconnect().await;
        report.transport_powered_off = self.ctx.transport.power_off().await;
        report.gps_released = self.ctx.locator.release_within(TEARDOWN_LOCK_TIMEOUT).await;

        match self.ctx.queue.lock_within(TEARDOWN_LOCK_TIMEOUT).await {
            Ok(mut queue) => {
                queue.close();
                report.storage_closed = true;
            }
            Err(e) => warn!(error = %e, "Storage close skipped"),
        }

        self.hal.set_power_latch(false);
        time::sleep(LATCH_SETTLE).await;
        self.state.send_replace(LifecycleState::PoweredOff);
        info!(?report, "Power latch released");

        if !self.hal.latch_cuts_power() {
            warn!("Power latch did not cut power, entering indefinite deep sleep");
            self.hal.deep_sleep(None, false).await;
        }
        Some(report)
    }

    /// Timed deep sleep with a button wake. Waking is a fresh boot: the
    /// latch, LED and button are re-armed before returning.
    pub async fn deep_sleep(&self, duration: Duration) -> WakeCause {
        info!(seconds = duration.as_secs(), "Entering deep sleep");
        self.sleep_until(Some(duration)).await
    }

    /// Sleeps until the button is pressed.
    pub async fn halt(&self) -> WakeCause {
        warn!("Halting until button wake");
        self.sleep_until(None).await
    }

    async fn sleep_until(&self, duration: Option<Duration>) -> WakeCause {
        self.hal.detach_button_interrupt();
        self.hal.set_status_led(false);
        self.state.send_replace(LifecycleState::Sleeping);
        let cause = self.hal.deep_sleep(duration, true).await;
        self.power_on();
        cause
    }

    pub async fn wait_powered_off(&self) {
        let mut state = self.state.subscribe();
        // The sender lives as long as `self`, so this only ends on PoweredOff.
        let _ = state.wait_for(|s| *s == LifecycleState::PoweredOff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::HostHal;
    use crate::mock::MockDevice;
    use crate::net::RESOURCE_POST;
    use crate::types::Reading;
    use tempfile::TempDir;

    #[test]
    fn instruction_needs_acknowledgement() {
        let power = PowerInstructions::new();
        assert!(!power.should_shutdown());
        assert_eq!(power.status(), PowerStatus::On);

        power.apply(PowerInstruction::TurnOff);
        assert!(!power.should_shutdown());
        assert!(power.report_pending());
        assert_eq!(power.status(), PowerStatus::Off);

        power.acknowledge();
        assert!(power.should_shutdown());
        assert!(!power.report_pending());

        power.apply(PowerInstruction::TurnOff);
        assert!(power.should_shutdown());

        power.clear();
        assert!(!power.should_shutdown());
        assert_eq!(power.status(), PowerStatus::On);
    }

    #[test]
    fn acknowledge_without_instruction_only_clears_report() {
        let power = PowerInstructions::new();
        power.acknowledge();
        assert!(!power.should_shutdown());
        assert_eq!(power.instruction(), PowerInstruction::None);
    }

    #[test]
    fn edges_inside_debounce_window_are_dropped() {
        let irq = ButtonIrq::new(BUTTON_DEBOUNCE);
        assert!(irq.on_edge_at(1_000));
        assert!(!irq.on_edge_at(50_000));
        assert!(irq.on_edge_at(81_000));
        assert!(!irq.on_edge_at(100_000));
    }

    fn controller(dir: &TempDir, latch_cuts_power: bool) -> (MockDevice, Arc<HostHal>, Arc<PowerController>) {
        let device = MockDevice::boot(dir.path(), vec![]).unwrap();
        let hal = Arc::new(HostHal::new(latch_cuts_power));
        let power = PowerController::new(device.ctx.clone(), hal.clone());
        power.power_on();
        (device, hal, power)
    }

    #[tokio::test(start_paused = true)]
    async fn held_press_shuts_down_in_order() {
        let dir = TempDir::new().unwrap();
        let (device, hal, power) = controller(&dir, true);
        assert!(device.ctx.transport.connect_with("apn", "u", "p", Duration::from_secs(1)).await);
        let task = power.spawn_button_task();

        hal.press_for(Duration::from_millis(200)).await;
        task.await.unwrap();

        assert_eq!(power.state(), LifecycleState::PoweredOff);
        assert!(device.ctx.shutdown.is_requested());
        assert!(!hal.latch_on());
        assert!(!hal.led_on());
        assert!(!hal.interrupt_attached());

        let log = &device.log;
        let disconnect = log.position("transport.disconnect").unwrap();
        let power_off = log.position("transport.power_off").unwrap();
        let gps_close = log.position("gps.close").unwrap();
        let gps_down = log.position("gps.power_down").unwrap();
        assert!(disconnect < power_off && power_off < gps_close && gps_close < gps_down);

        let reading = Reading::status_report("TESTDEV001", PowerStatus::On, None);
        assert!(device.ctx.queue.append(&reading).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn bounce_does_not_shut_down() {
        let dir = TempDir::new().unwrap();
        let (device, hal, power) = controller(&dir, true);
        let task = power.spawn_button_task();

        hal.press_for(Duration::from_millis(20)).await;
        time::sleep(Duration::from_millis(200)).await;

        assert_eq!(power.state(), LifecycleState::Running);
        assert!(!device.ctx.shutdown.is_requested());
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_runs_once() {
        let dir = TempDir::new().unwrap();
        let (_device, _hal, power) = controller(&dir, true);
        let report = power.graceful_shutdown().await.unwrap();
        assert!(report.storage_closed);
        assert!(report.gps_released);
        assert!(power.graceful_shutdown().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_storage_is_skipped_not_waited_on() {
        let dir = TempDir::new().unwrap();
        let (device, _hal, power) = controller(&dir, true);
        let held = device.ctx.queue.lock().await;

        let report = power.graceful_shutdown().await.unwrap();
        assert!(!report.storage_closed);
        assert!(report.gps_released);
        assert_eq!(power.state(), LifecycleState::PoweredOff);
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_transport_is_skipped_not_waited_on() {
        let dir = TempDir::new().unwrap();
        let (device, _hal, power) = controller(&dir, true);
        assert!(device.connect().await);
        device.script.set_post_delay(Duration::from_secs(120));

        let upload = tokio::spawn({
            let ctx = device.ctx.clone();
            async move { ctx.transport.post(&ctx.endpoint(), RESOURCE_POST, "[]").await }
        });
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(device.script.posts().len(), 1);

        let started = time::Instant::now();
        let report = power.graceful_shutdown().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(!report.transport_disconnected);
        assert!(!report.transport_powered_off);
        assert!(report.storage_closed);
        assert_eq!(power.state(), LifecycleState::PoweredOff);
        assert!(!device.log.contains("transport.disconnect"));
        upload.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn soft_latch_falls_back_to_indefinite_sleep() {
        let dir = TempDir::new().unwrap();
        let (_device, hal, power) = controller(&dir, false);
        let running = power.clone();
        let _task = tokio::spawn(async move { running.graceful_shutdown().await });

        power.wait_powered_off().await;
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hal.sleeps(), vec![None]);
    }

    #[tokio::test(start_paused = true)]
    async fn deep_sleep_rearms_on_wake() {
        let dir = TempDir::new().unwrap();
        let (_device, hal, power) = controller(&dir, true);

        let cause = power.deep_sleep(Duration::from_secs(60)).await;
        assert_eq!(cause, WakeCause::Timer);
        assert_eq!(hal.sleeps(), vec![Some(Duration::from_secs(60))]);
        assert_eq!(power.state(), LifecycleState::Running);
        assert!(hal.interrupt_attached());
        assert!(hal.led_on());
    }

    #[tokio::test(start_paused = true)]
    async fn press_while_asleep_wakes_without_shutdown() {
        let dir = TempDir::new().unwrap();
        let (device, hal, power) = controller(&dir, true);
        let task = power.spawn_button_task();

        let sleeper = power.clone();
        let sleep = tokio::spawn(async move { sleeper.halt().await });
        time::sleep(Duration::from_millis(10)).await;
        assert!(!hal.interrupt_attached());
        hal.press_for(Duration::from_millis(200)).await;

        assert_eq!(sleep.await.unwrap(), WakeCause::Button);
        assert_eq!(power.state(), LifecycleState::Running);
        assert!(!device.ctx.shutdown.is_requested());
        task.abort();
    }
}
