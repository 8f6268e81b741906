//! Minimal OS abstraction: time, delay and the polling primitives the
//! engine builds its completion waits out of.

use core::time::Duration;

/// Services the embedding kernel provides to the stack.
pub trait Kernel: Send + Sync + 'static {
    /// Monotonic clock.
    fn now(&self) -> Duration;

    /// Blocks the calling task for the given interval.
    fn delay(&self, duration: Duration);
}

/// Future that stays pending while `condition` holds, re-waking itself each
/// poll. The executor keeps the task hot; completion latency is one poll.
pub struct SpinWhile<F>
where
    F: Fn() -> bool,
{
    pub condition: F,
}

impl<F> SpinWhile<F>
where
    F: Fn() -> bool,
{
    #[must_use]
    pub fn new(condition: F) -> Self {
        Self { condition }
    }
}

impl<F> core::future::Future for SpinWhile<F>
where
    F: Fn() -> bool,
{
    type Output = ();

    fn poll(
        self: core::pin::Pin<&mut Self>,
        cx: &mut core::task::Context<'_>,
    ) -> core::task::Poll<Self::Output> {
        if (self.condition)() {
            cx.waker().wake_by_ref();
            core::task::Poll::Pending
        } else {
            core::task::Poll::Ready(())
        }
    }
}

/// Absolute expiry point on the kernel clock.
#[derive(Clone, Copy)]
pub struct Deadline(Duration);

impl Deadline {
    pub fn after(kernel: &dyn Kernel, timeout: Duration) -> Self {
        Self(kernel.now() + timeout)
    }

    pub fn expired(&self, kernel: &dyn Kernel) -> bool {
        kernel.now() >= self.0
    }
}
