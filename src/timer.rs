//! Timing strategies for the latency benchmarker.
//!
//! A [`Timer`] is picked once, when the benchmark is set up, from the device
//! the work runs on:
//!
//! - [`WallClockTimer`] reads the host's monotonic clock. Correct whenever the
//!   timed calls return only after their work is done.
//! - [`DeviceTimer`] brackets the timed region with device events. Device work
//!   is asynchronous relative to the issuing thread, so the timer places a
//!   synchronization barrier before the start event and before reading the
//!   elapsed time.
//!
//! On macOS the Metal runtime fences the same command queue the model's GEMM
//! kernels are committed to, so a barrier waits for every kernel issued
//! before it.

use std::time::{Duration, Instant};

use crate::{Error, Result};

pub trait Timer {
    fn start(&mut self) -> Result<()>;

    /// Ends the timed region and returns its length.
    fn stop(&mut self) -> Result<Duration>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
pub struct WallClockTimer {
    started: Option<Instant>,
}

impl WallClockTimer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Timer for WallClockTimer {
    fn start(&mut self) -> Result<()> {
        self.started = Some(Instant::now());
        Ok(())
    }

    fn stop(&mut self) -> Result<Duration> {
        let end = Instant::now();
        let start = self
            .started
            .take()
            .ok_or_else(|| Error::Timer("stop called before start".to_string()))?;
        Ok(end.duration_since(start))
    }

    fn name(&self) -> &'static str {
        "wall-clock"
    }
}

/// Event primitives of an accelerator runtime.
pub trait DeviceRuntime {
    type Event;

    /// Enqueues a marker after all work issued so far.
    fn record(&self) -> Result<Self::Event>;

    /// Blocks until all issued device work has completed.
    fn synchronize(&self) -> Result<()>;

    /// Time between two recorded events. Both must have completed.
    fn elapsed(&self, start: &Self::Event, end: &Self::Event) -> Result<Duration>;

    fn name(&self) -> &'static str;
}

pub struct DeviceTimer<R: DeviceRuntime> {
    runtime: R,
    start: Option<R::Event>,
}

impl<R: DeviceRuntime> DeviceTimer<R> {
    pub fn new(runtime: R) -> Self {
        DeviceTimer {
            runtime,
            start: None,
        }
    }

    #[cfg(test)]
    fn runtime(&self) -> &R {
        &self.runtime
    }
}

impl<R: DeviceRuntime> Timer for DeviceTimer<R> {
    fn start(&mut self) -> Result<()> {
        // Drain the warm-up call before the start marker.
        self.runtime.synchronize()?;
        self.start = Some(self.runtime.record()?);
        Ok(())
    }

    fn stop(&mut self) -> Result<Duration> {
        let start = self
            .start
            .take()
            .ok_or_else(|| Error::Timer("stop called before start".to_string()))?;
        let end = self.runtime.record()?;
        self.runtime.synchronize()?;
        self.runtime.elapsed(&start, &end)
    }

    fn name(&self) -> &'static str {
        self.runtime.name()
    }
}

#[cfg(target_os = "macos")]
pub use self::metal_runtime::{MetalEvent, MetalRuntime};

#[cfg(target_os = "macos")]
mod metal_runtime {
    use std::time::{Duration, Instant};

    use super::DeviceRuntime;
    use crate::pipeline::with_context;
    use crate::Result;

    /// Events are completion fences on the command queue that model kernels
    /// are committed to: recording waits until the queue has drained every
    /// buffer committed before it, then stamps the host clock.
    pub struct MetalRuntime {
        _private: (),
    }

    #[derive(Debug, Clone, Copy)]
    pub struct MetalEvent {
        completed_at: Instant,
    }

    impl MetalRuntime {
        pub fn new() -> Result<Self> {
            with_context(|_| Ok(()))?;
            Ok(MetalRuntime { _private: () })
        }

        fn fence(&self) -> Result<()> {
            with_context(|context| {
                context.fence();
                Ok(())
            })
        }
    }

    impl DeviceRuntime for MetalRuntime {
        type Event = MetalEvent;

        fn record(&self) -> Result<MetalEvent> {
            self.fence()?;
            Ok(MetalEvent {
                completed_at: Instant::now(),
            })
        }

        fn synchronize(&self) -> Result<()> {
            self.fence()
        }

        fn elapsed(&self, start: &MetalEvent, end: &MetalEvent) -> Result<Duration> {
            Ok(end.completed_at.saturating_duration_since(start.completed_at))
        }

        fn name(&self) -> &'static str {
            "metal-events"
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::thread;
    use std::time::Duration;

    use super::*;

    /// Fake runtime whose clock only advances on `synchronize`.
    #[derive(Default)]
    struct RecordingRuntime {
        calls: RefCell<Vec<&'static str>>,
        clock: Cell<u64>,
    }

    impl DeviceRuntime for RecordingRuntime {
        type Event = u64;

        fn record(&self) -> Result<u64> {
            self.calls.borrow_mut().push("record");
            Ok(self.clock.get())
        }

        fn synchronize(&self) -> Result<()> {
            self.calls.borrow_mut().push("synchronize");
            self.clock.set(self.clock.get() + 10);
            Ok(())
        }

        fn elapsed(&self, start: &u64, end: &u64) -> Result<Duration> {
            self.calls.borrow_mut().push("elapsed");
            Ok(Duration::from_millis(end - start))
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    #[test]
    fn device_timer_synchronizes_around_events() {
        let mut timer = DeviceTimer::new(RecordingRuntime::default());
        timer.start().unwrap();
        let elapsed = timer.stop().unwrap();
        assert_eq!(
            *timer.runtime().calls.borrow(),
            vec!["synchronize", "record", "record", "synchronize", "elapsed"]
        );
        // Start and end markers were both recorded after the first barrier.
        assert_eq!(elapsed, Duration::ZERO);
        assert_eq!(timer.name(), "recording");
    }

    #[test]
    fn stop_without_start_is_an_error() {
        assert!(WallClockTimer::new().stop().is_err());
        assert!(DeviceTimer::new(RecordingRuntime::default()).stop().is_err());
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn metal_timer_brackets_kernels_on_the_model_queue() {
        use crate::device::Device;
        use crate::gemm::gemm;
        use crate::tensor::Tensor;

        if Device::Metal.check_available().is_err() {
            return;
        }
        let mut timer = DeviceTimer::new(MetalRuntime::new().unwrap());
        let a = Tensor::<f32>::full([64, 64], 1.0);
        timer.start().unwrap();
        let c = gemm(Device::Metal, &a, &a, true, None, None).unwrap();
        let elapsed = timer.stop().unwrap();
        assert!(elapsed > Duration::ZERO);
        assert_eq!(c.data()[0], 64.0);
        assert_eq!(timer.name(), "metal-events");
    }

    #[test]
    fn wall_clock_measures_sleep() {
        let mut timer = WallClockTimer::new();
        timer.start().unwrap();
        thread::sleep(Duration::from_millis(5));
        assert!(timer.stop().unwrap() >= Duration::from_millis(5));
    }
}
