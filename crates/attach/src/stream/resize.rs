//! Remote terminal resizing.
//!
//! A [`ResizeMonitor`] keeps the remote pseudo-terminal the same size as the
//! local one. It sends an initial resize (retrying briefly, since the remote
//! process may not have its terminal yet), then follows local size changes
//! until its cancellation token fires.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::terminal::{LocalTerminalSize, SizeSource, TerminalSize};

/// Polling period where no window-change signal is available.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Retries after a failed initial resize.
pub const DEFAULT_INITIAL_RETRIES: u32 = 5;

/// Delay between initial resize attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Something that can resize the remote terminal.
pub trait Resizer: Send + Sync + 'static {
    /// Apply a new size. Note the `(height, width)` order used by engines.
    fn resize(&self, height: u16, width: u16) -> impl Future<Output = anyhow::Result<()>> + Send;
}

impl<F, Fut> Resizer for F
where
    F: Fn(u16, u16) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn resize(&self, height: u16, width: u16) -> impl Future<Output = anyhow::Result<()>> + Send {
        self(height, width)
    }
}

/// Remembers the last size sent so only real changes go out.
#[derive(Debug, Default, Clone)]
pub struct ResizeTracker {
    last: Option<TerminalSize>,
}

impl ResizeTracker {
    /// Feed a reading. Returns the size to send, if any.
    ///
    /// Unknown sizes and sizes with a zero dimension are ignored.
    pub fn observe(&mut self, size: Option<TerminalSize>) -> Option<TerminalSize> {
        let size = size?;
        if size.0 == 0 || size.1 == 0 || self.last == Some(size) {
            return None;
        }
        self.last = Some(size);
        Some(size)
    }

    /// The last size handed out by [`observe`](Self::observe).
    pub fn last(&self) -> Option<TerminalSize> {
        self.last
    }
}

/// What wakes the monitor up to re-read the local size.
pub enum ResizeTrigger {
    /// Window-change signal delivery.
    #[cfg(unix)]
    Signal(tokio::signal::unix::Signal),
    /// Fixed-interval polling.
    Poll(Interval),
}

impl ResizeTrigger {
    /// Pick the platform strategy: `SIGWINCH` on Unix, polling otherwise or
    /// when the signal cannot be subscribed to.
    pub fn detect(poll_interval: Duration) -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::window_change()) {
                Ok(stream) => return Self::Signal(stream),
                Err(e) => {
                    warn!(error = %e, "Window-change signal unavailable, polling for resizes")
                }
            }
        }
        Self::poll(poll_interval)
    }

    /// Poll every `period`, starting one period from now.
    pub fn poll(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self::Poll(interval)
    }

    /// Wait for the next wake-up. `false` means no more will come.
    async fn tick(&mut self) -> bool {
        match self {
            #[cfg(unix)]
            Self::Signal(stream) => stream.recv().await.is_some(),
            Self::Poll(interval) => {
                interval.tick().await;
                true
            }
        }
    }
}

/// Timing knobs for a [`ResizeMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeSettings {
    pub poll_interval: Duration,
    pub initial_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ResizeSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            initial_retries: DEFAULT_INITIAL_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Background task that mirrors local terminal size changes to the remote.
pub struct ResizeMonitor<R> {
    resizer: R,
    source: Arc<dyn SizeSource>,
    trigger: Option<ResizeTrigger>,
    settings: ResizeSettings,
}

impl<R: Resizer> ResizeMonitor<R> {
    /// Monitor the local terminal, resizing through `resizer`.
    pub fn new(resizer: R) -> Self {
        Self {
            resizer,
            source: Arc::new(LocalTerminalSize),
            trigger: None,
            settings: ResizeSettings::default(),
        }
    }

    /// Read sizes from `source` instead of the local terminal.
    pub fn with_source(mut self, source: Arc<dyn SizeSource>) -> Self {
        self.source = source;
        self
    }

    /// Use `trigger` instead of detecting one when the task starts.
    pub fn with_trigger(mut self, trigger: ResizeTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_settings(mut self, settings: ResizeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Start the monitor. It runs until `cancel` fires or its trigger ends.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(mut self, cancel: CancellationToken) {
        // Subscribe first so a change during the initial resize is not lost.
        let mut trigger = match self.trigger.take() {
            Some(trigger) => trigger,
            None => ResizeTrigger::detect(self.settings.poll_interval),
        };

        let mut tracker = ResizeTracker::default();
        match tracker.observe(self.source.size()) {
            Some((width, height)) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = self.initial_resize(height, width) => {}
                }
            }
            None => debug!("Local terminal size unknown, skipping initial resize"),
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                alive = trigger.tick() => {
                    if !alive {
                        debug!("Resize trigger closed");
                        break;
                    }
                    let Some((width, height)) = tracker.observe(self.source.size()) else {
                        continue;
                    };
                    match self.resizer.resize(height, width).await {
                        Ok(()) => trace!(height, width, "Resized remote terminal"),
                        Err(e) => warn!(height, width, error = %e, "Failed to resize remote terminal"),
                    }
                }
            }
        }

        debug!("Resize monitor stopped");
    }

    async fn initial_resize(&self, height: u16, width: u16) {
        let mut attempt = 0;
        loop {
            match self.resizer.resize(height, width).await {
                Ok(()) => {
                    debug!(height, width, attempt, "Initial resize applied");
                    return;
                }
                Err(e) if attempt < self.settings.initial_retries => {
                    attempt += 1;
                    trace!(height, width, attempt, error = %e, "Initial resize failed, retrying");
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
                Err(e) => {
                    warn!(
                        height,
                        width,
                        error = %e,
                        "Initial resize failed, remote side keeps its default size"
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::FixedSize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Calls = Arc<Mutex<Vec<(u16, u16)>>>;

    #[derive(Clone, Default)]
    struct SharedSize(Arc<Mutex<Option<TerminalSize>>>);

    impl SharedSize {
        fn new(size: Option<TerminalSize>) -> Self {
            Self(Arc::new(Mutex::new(size)))
        }

        fn set(&self, size: Option<TerminalSize>) {
            *self.0.lock().unwrap() = size;
        }
    }

    impl SizeSource for SharedSize {
        fn size(&self) -> Option<TerminalSize> {
            *self.0.lock().unwrap()
        }
    }

    fn idle_trigger() -> ResizeTrigger {
        ResizeTrigger::poll(Duration::from_secs(3600))
    }

    #[test]
    fn test_tracker_suppresses_repeats() {
        let mut tracker = ResizeTracker::default();
        assert_eq!(tracker.observe(Some((80, 24))), Some((80, 24)));
        assert_eq!(tracker.observe(Some((80, 24))), None);
        assert_eq!(tracker.observe(Some((100, 24))), Some((100, 24)));
        assert_eq!(tracker.last(), Some((100, 24)));
    }

    #[test]
    fn test_tracker_ignores_unknown_and_zero() {
        let mut tracker = ResizeTracker::default();
        assert_eq!(tracker.observe(None), None);
        assert_eq!(tracker.observe(Some((0, 0))), None);
        assert_eq!(tracker.observe(Some((80, 0))), None);
        assert_eq!(tracker.last(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_resize_retries_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let resizer = move |_h: u16, _w: u16| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    anyhow::bail!("no such exec yet");
                }
                Ok(())
            }
        };

        let cancel = CancellationToken::new();
        let handle = ResizeMonitor::new(resizer)
            .with_source(Arc::new(FixedSize(Some((80, 24)))))
            .with_trigger(idle_trigger())
            .spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_resize_gives_up_after_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let resizer = move |_h: u16, _w: u16| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow::anyhow!("daemon refused")) }
        };

        let cancel = CancellationToken::new();
        let handle = ResizeMonitor::new(resizer)
            .with_source(Arc::new(FixedSize(Some((80, 24)))))
            .with_trigger(idle_trigger())
            .spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(
            attempts.load(Ordering::SeqCst),
            1 + DEFAULT_INITIAL_RETRIES as usize
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_size_skips_initial_resize() {
        let calls: Calls = Arc::default();
        let recorded = Arc::clone(&calls);
        let resizer = move |h: u16, w: u16| {
            recorded.lock().unwrap().push((h, w));
            async { anyhow::Ok(()) }
        };

        let cancel = CancellationToken::new();
        let handle = ResizeMonitor::new(resizer)
            .with_source(Arc::new(FixedSize(None)))
            .with_trigger(ResizeTrigger::poll(Duration::from_millis(50)))
            .spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_sends_only_changes() {
        let size = SharedSize::new(Some((80, 24)));
        let calls: Calls = Arc::default();
        let recorded = Arc::clone(&calls);
        let resizer = move |h: u16, w: u16| {
            recorded.lock().unwrap().push((h, w));
            async { anyhow::Ok(()) }
        };

        let cancel = CancellationToken::new();
        let handle = ResizeMonitor::new(resizer)
            .with_source(Arc::new(size.clone()))
            .with_trigger(ResizeTrigger::poll(Duration::from_millis(250)))
            .spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(600)).await;
        size.set(Some((100, 30)));
        tokio::time::sleep(Duration::from_millis(300)).await;
        size.set(Some((0, 0)));
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![(24, 80), (30, 100)]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_window_change_during_initial_resize_is_followed() {
        use nix::sys::signal::{raise, Signal};

        let size = SharedSize::new(Some((80, 24)));
        let calls: Calls = Arc::default();
        let recorded = Arc::clone(&calls);
        let changing = size.clone();
        let resizer = move |h: u16, w: u16| {
            let first = {
                let mut calls = recorded.lock().unwrap();
                calls.push((h, w));
                calls.len() == 1
            };
            if first {
                // The window changes while the first attempt is in flight.
                changing.set(Some((100, 30)));
                raise(Signal::SIGWINCH).unwrap();
            }
            async move {
                if first {
                    anyhow::bail!("no such exec yet");
                }
                Ok(())
            }
        };

        let cancel = CancellationToken::new();
        let handle = ResizeMonitor::new(resizer)
            .with_source(Arc::new(size))
            .spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![(24, 80), (24, 80), (30, 100)]);
    }

    #[tokio::test]
    async fn test_cancel_stops_monitor() {
        let resizer = |_h: u16, _w: u16| async { anyhow::Ok(()) };
        let cancel = CancellationToken::new();
        let handle = ResizeMonitor::new(resizer)
            .with_source(Arc::new(FixedSize(Some((80, 24)))))
            .with_trigger(idle_trigger())
            .spawn(cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
    }
}
