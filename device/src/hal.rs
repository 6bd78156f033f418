use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time;
use tracing::{debug, info};

use crate::power::ButtonIrq;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    Timer,
    Button,
}

/// Board-level power pins: the enable latch, the status LED, the button
/// line and the sleep controller.
#[async_trait]
pub trait PowerHal: Send + Sync {
    fn set_power_latch(&self, on: bool);

    /// False when the enable line is not a real latch and the board keeps
    /// running after it is released.
    fn latch_cuts_power(&self) -> bool;

    fn set_status_led(&self, on: bool);

    /// True while the button holds the line low.
    fn button_asserted(&self) -> bool;

    /// Routes falling edges on the button line to `irq`.
    fn attach_button_interrupt(&self, irq: Arc<ButtonIrq>);

    fn detach_button_interrupt(&self);

    /// Sleeps until the timer (if any) expires or, when armed, the button is
    /// pressed. `None` with no button wake never returns.
    async fn deep_sleep(&self, duration: Option<Duration>, wake_on_button: bool) -> WakeCause;
}

/// Host stand-in for the board. The button is driven by `press`/`release`.
pub struct HostHal {
    latch: AtomicBool,
    latch_cuts_power: bool,
    led: AtomicBool,
    led_changes: AtomicUsize,
    button: AtomicBool,
    irq: Mutex<Option<Arc<ButtonIrq>>>,
    wake: Notify,
    sleeps: Mutex<Vec<Option<Duration>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HostHal {
    pub fn new(latch_cuts_power: bool) -> Self {
        HostHal {
            latch: AtomicBool::new(false),
            latch_cuts_power,
            led: AtomicBool::new(false),
            led_changes: AtomicUsize::new(0),
            button: AtomicBool::new(false),
            irq: Mutex::new(None),
            wake: Notify::new(),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn press(&self) {
        self.button.store(true, Ordering::SeqCst);
        let irq = lock(&self.irq).clone();
        if let Some(irq) = irq {
            irq.on_edge();
        }
        self.wake.notify_waiters();
    }

    pub fn release(&self) {
        self.button.store(false, Ordering::SeqCst);
    }

    /// Holds the button down for `hold`.
    pub async fn press_for(&self, hold: Duration) {
        self.press();
        time::sleep(hold).await;
        self.release();
    }

    pub fn latch_on(&self) -> bool {
        self.latch.load(Ordering::SeqCst)
    }

    pub fn led_on(&self) -> bool {
        self.led.load(Ordering::SeqCst)
    }

    pub fn led_changes(&self) -> usize {
        self.led_changes.load(Ordering::SeqCst)
    }

    pub fn interrupt_attached(&self) -> bool {
        lock(&self.irq).is_some()
    }

    /// Every deep sleep entered so far, `None` for an indefinite one.
    pub fn sleeps(&self) -> Vec<Option<Duration>> {
        lock(&self.sleeps).clone()
    }
}

#[async_trait]
impl PowerHal for HostHal {
    fn set_power_latch(&self, on: bool) {
        self.latch.store(on, Ordering::SeqCst);
        debug!(on, "Power latch");
    }

    fn latch_cuts_power(&self) -> bool {
        self.latch_cuts_power
    }

    fn set_status_led(&self, on: bool) {
        if self.led.swap(on, Ordering::SeqCst) != on {
            self.led_changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn button_asserted(&self) -> bool {
        self.button.load(Ordering::SeqCst)
    }

    fn attach_button_interrupt(&self, irq: Arc<ButtonIrq>) {
        *lock(&self.irq) = Some(irq);
    }

    fn detach_button_interrupt(&self) {
        *lock(&self.irq) = None;
    }

    async fn deep_sleep(&self, duration: Option<Duration>, wake_on_button: bool) -> WakeCause {
        lock(&self.sleeps).push(duration);
        let button = async {
            if wake_on_button {
                self.wake.notified().await;
            } else {
                std::future::pending::<()>().await;
            }
        };
        let cause = match duration {
            Some(duration) => tokio::select! {
                _ = time::sleep(duration) => WakeCause::Timer,
                _ = button => WakeCause::Button,
            },
            None => {
                button.await;
                WakeCause::Button
            }
        };
        info!(?cause, "Woke from deep sleep");
        cause
    }
}
