// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Blocking primitives shared by the pool, the server monitor and the cluster.

use {
	crate::{Error, Result},
	std::{
		sync::{Arc, Mutex, MutexGuard, Condvar, PoisonError, atomic::{AtomicBool, Ordering}},
		time::{Duration, Instant},
		io
	},
	log::trace
};

/// Upper bound for a single condvar wait while a cancellable token is being observed.
const CANCELLATION_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Cooperative cancellation, checked at every wait boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Option<Arc<AtomicBool>>);

impl CancellationToken {
	pub fn new() -> Self {
		Self(Some(Arc::new(AtomicBool::new(false))))
	}

	/// A token that can never be cancelled, waits on it are not sliced.
	pub fn none() -> Self {
		Self(None)
	}

	pub fn cancel(&self) {
		if let Some(flag) = &self.0 {
			flag.store(true, Ordering::SeqCst);
		}
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.as_ref().map_or(false, |flag| flag.load(Ordering::SeqCst))
	}

	pub fn check(&self) -> Result<()> {
		if self.is_cancelled() { Err(Error::Cancelled) } else { Ok(()) }
	}

	fn slice(&self, remaining: Duration) -> Duration {
		match self.0 {
			Some(_) => remaining.min(CANCELLATION_CHECK_INTERVAL),
			None    => remaining
		}
	}
}

/// Blocks on `condvar` while `condition` holds, until `timeout` elapses or `cancel` fires.
/// Returns the guard and whether the wait timed out.
pub(crate) fn wait_while<'a, T>(
	condvar:       &Condvar,
	mut guard:     MutexGuard<'a, T>,
	timeout:       Duration,
	cancel:        &CancellationToken,
	mut condition: impl FnMut(&mut T) -> bool
) -> Result<(MutexGuard<'a, T>, bool)> {
	let deadline = Instant::now().checked_add(timeout);
	loop {
		if !condition(&mut *guard) {
			return Ok((guard, false));
		}

		cancel.check()?;

		let remaining = match deadline {
			None => Duration::from_secs(u32::MAX as u64),
			Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
				Some(remaining) if remaining > Duration::from_millis(0) => remaining,
				_ => return Ok((guard, true))
			}
		};

		guard = condvar.wait_timeout(guard, cancel.slice(remaining))?.0;
	}
}

#[derive(Debug)]
struct Permits {
	available: usize,
	closed:    bool
}

/// Counting semaphore with timed, cancellable acquisition.
#[derive(Debug)]
pub struct Semaphore {
	permits: Mutex<Permits>,
	condvar: Condvar
}

impl Semaphore {
	pub fn new(permits: usize) -> Self {
		Self {
			permits: Mutex::new(Permits { available: permits, closed: false }),
			condvar: Condvar::new()
		}
	}

	pub fn available(&self) -> usize {
		self.permits.lock().unwrap_or_else(PoisonError::into_inner).available
	}

	#[cfg(test)]
	fn try_acquire(&self) -> bool {
		let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
		if permits.available > 0 && !permits.closed {
			permits.available -= 1;
			true
		} else {
			false
		}
	}

	/// Returns `Ok(false)` if no permit became available within `timeout`, and
	/// [`Error::Disposed`] once the semaphore is closed.
	pub fn acquire(&self, timeout: Duration, cancel: &CancellationToken) -> Result<bool> {
		let (mut permits, timed_out) = wait_while(
			&self.condvar, self.permits.lock()?, timeout, cancel,
			|permits| permits.available == 0 && !permits.closed)?;

		if permits.closed {
			return Err(Error::Disposed("semaphore"));
		}

		if timed_out {
			return Ok(false);
		}

		permits.available -= 1;
		Ok(true)
	}

	pub fn release(&self) {
		self.permits.lock().unwrap_or_else(PoisonError::into_inner).available += 1;
		self.condvar.notify_one();
	}

	/// Fails all current and future acquisitions. Released permits are still counted.
	pub fn close(&self) {
		self.permits.lock().unwrap_or_else(PoisonError::into_inner).closed = true;
		self.condvar.notify_all();
	}
}

/// A monotonic version counter that waiters can block on until it changes.
#[derive(Debug, Default)]
pub struct ChangeSignal {
	version: Mutex<u64>,
	condvar: Condvar
}

impl ChangeSignal {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn version(&self) -> u64 {
		*self.version.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn notify(&self) {
		*self.version.lock().unwrap_or_else(PoisonError::into_inner) += 1;
		self.condvar.notify_all();
	}

	/// Waits until the version differs from `seen`. Returns `Ok(false)` on timeout.
	pub fn wait_for_change(&self, seen: u64, timeout: Duration, cancel: &CancellationToken) -> Result<bool> {
		let (_guard, timed_out) = wait_while(
			&self.condvar, self.version.lock()?, timeout, cancel, |version| *version == seen)?;
		Ok(!timed_out)
	}
}

#[derive(Debug)]
struct TimerState {
	interval:  Duration,
	/// `None` if the interval is too large to be represented, the timer then only runs
	/// when triggered.
	next_due:  Option<Instant>,
	triggered: bool,
	cancelled: bool
}

#[derive(Debug)]
struct TimerInner {
	state:   Mutex<TimerState>,
	condvar: Condvar
}

/// Runs a callback on a dedicated thread at a fixed interval. The interval can be changed
/// from inside the callback, and a run can be requested out of band.
#[derive(Debug)]
pub struct PeriodicTimer(Arc<TimerInner>);

impl PeriodicTimer {
	/// The first run happens after `initial_delay`.
	pub fn start(
		name:          &str,
		initial_delay: Duration,
		interval:      Duration,
		mut callback:  impl FnMut() + Send + 'static
	) -> io::Result<Self> {
		let inner = Arc::new(TimerInner {
			state: Mutex::new(TimerState {
				interval,
				next_due:  Instant::now().checked_add(initial_delay),
				triggered: false,
				cancelled: false
			}),
			condvar: Condvar::new()
		});

		let cloned = inner.clone();
		std::thread::Builder::new()
			.name(name.to_string())
			.spawn(move || {
				let inner = cloned;
				let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
				loop {
					if state.cancelled {
						break;
					}

					let now = Instant::now();
					if state.triggered || state.next_due.map_or(false, |next_due| now >= next_due) {
						state.triggered = false;
						state.next_due = now.checked_add(state.interval);
						drop(state);
						callback();
						state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
						continue;
					}

					state = match state.next_due {
						Some(next_due) => inner.condvar.wait_timeout(state, next_due - now)
							.unwrap_or_else(PoisonError::into_inner).0,
						None => inner.condvar.wait(state)
							.unwrap_or_else(PoisonError::into_inner)
					};
				}
				trace!("timer thread exited");
			})?;

		Ok(Self(inner))
	}

	/// Sets a new interval, the next run happens one new interval from now.
	pub fn reschedule(&self, interval: Duration) {
		let mut state = self.0.state.lock().unwrap_or_else(PoisonError::into_inner);
		state.interval = interval;
		state.next_due = Instant::now().checked_add(interval);
		self.0.condvar.notify_all();
	}

	/// Requests an immediate run. Requests made while a run is in progress collapse into one.
	pub fn trigger(&self) {
		self.0.state.lock().unwrap_or_else(PoisonError::into_inner).triggered = true;
		self.0.condvar.notify_all();
	}

	/// Stops the timer without waiting for a running callback, so it may be called from the
	/// callback itself.
	pub fn cancel(&self) {
		self.0.state.lock().unwrap_or_else(PoisonError::into_inner).cancelled = true;
		self.0.condvar.notify_all();
	}

	pub fn interval(&self) -> Duration {
		self.0.state.lock().unwrap_or_else(PoisonError::into_inner).interval
	}
}

impl Drop for PeriodicTimer {
	fn drop(&mut self) {
		self.cancel();
	}
}

#[cfg(test)]
mod tests {
	use {super::*, std::sync::atomic::AtomicUsize, std::thread};

	#[test]
	fn semaphore_times_out_when_exhausted() {
		let semaphore = Semaphore::new(1);
		assert!(semaphore.try_acquire());
		assert!(!semaphore.try_acquire());

		let start = Instant::now();
		assert!(!semaphore.acquire(Duration::from_millis(50), &CancellationToken::none()).unwrap());
		assert!(start.elapsed() >= Duration::from_millis(50));

		semaphore.release();
		assert_eq!(semaphore.available(), 1);
	}

	#[test]
	fn semaphore_wakes_waiter_on_release() {
		let semaphore = Arc::new(Semaphore::new(0));
		let cloned = semaphore.clone();
		let handle = thread::spawn(move || cloned.acquire(Duration::from_secs(5), &CancellationToken::none()));
		thread::sleep(Duration::from_millis(20));
		semaphore.release();
		assert!(handle.join().unwrap().unwrap());
		assert_eq!(semaphore.available(), 0);
	}

	#[test]
	fn cancellation_is_distinct_from_timeout() {
		let semaphore = Arc::new(Semaphore::new(0));
		let token = CancellationToken::new();
		let (cloned, cloned_token) = (semaphore.clone(), token.clone());
		let handle = thread::spawn(move || cloned.acquire(Duration::from_secs(5), &cloned_token));
		thread::sleep(Duration::from_millis(20));
		token.cancel();
		assert!(matches!(handle.join().unwrap(), Err(Error::Cancelled)));
	}

	#[test]
	fn change_signal_wakes_waiters() {
		let signal = Arc::new(ChangeSignal::new());
		let seen = signal.version();
		assert!(!signal.wait_for_change(seen, Duration::from_millis(10), &CancellationToken::none()).unwrap());

		let cloned = signal.clone();
		let handle = thread::spawn(move || cloned.wait_for_change(seen, Duration::from_secs(5), &CancellationToken::none()));
		thread::sleep(Duration::from_millis(20));
		signal.notify();
		assert!(handle.join().unwrap().unwrap());
	}

	#[test]
	fn closing_a_semaphore_fails_waiters_but_keeps_the_count() {
		let semaphore = Arc::new(Semaphore::new(1));
		assert!(semaphore.acquire(Duration::MAX, &CancellationToken::none()).unwrap());

		let cloned = semaphore.clone();
		let handle = thread::spawn(move || cloned.acquire(Duration::MAX, &CancellationToken::none()));
		thread::sleep(Duration::from_millis(20));
		semaphore.close();
		assert!(matches!(handle.join().unwrap(), Err(Error::Disposed(_))));

		semaphore.release();
		assert_eq!(semaphore.available(), 1);
		assert!(!semaphore.try_acquire());
	}

	#[test]
	fn unbounded_waits_do_not_overflow() {
		let signal = Arc::new(ChangeSignal::new());
		let seen = signal.version();
		let cloned = signal.clone();
		let handle = thread::spawn(move || cloned.wait_for_change(seen, Duration::MAX, &CancellationToken::new()));
		thread::sleep(Duration::from_millis(20));
		signal.notify();
		assert!(handle.join().unwrap().unwrap());

		let counter = Arc::new(AtomicUsize::new(0));
		let cloned = counter.clone();
		let timer = PeriodicTimer::start("test-timer", Duration::MAX, Duration::MAX, move || {
			cloned.fetch_add(1, Ordering::SeqCst);
		}).unwrap();
		thread::sleep(Duration::from_millis(20));
		assert_eq!(counter.load(Ordering::SeqCst), 0);

		timer.trigger();
		thread::sleep(Duration::from_millis(50));
		assert_eq!(counter.load(Ordering::SeqCst), 1);
		timer.reschedule(Duration::MAX);
		timer.cancel();
	}

	#[test]
	fn timer_runs_reschedules_and_stops() {
		let counter = Arc::new(AtomicUsize::new(0));
		let cloned = counter.clone();
		let timer = PeriodicTimer::start("test-timer", Duration::from_millis(0), Duration::from_millis(10), move || {
			cloned.fetch_add(1, Ordering::SeqCst);
		}).unwrap();

		thread::sleep(Duration::from_millis(100));
		assert!(counter.load(Ordering::SeqCst) >= 2);

		timer.reschedule(Duration::from_secs(3600));
		thread::sleep(Duration::from_millis(30));
		let before = counter.load(Ordering::SeqCst);
		thread::sleep(Duration::from_millis(50));
		assert_eq!(counter.load(Ordering::SeqCst), before);

		timer.trigger();
		thread::sleep(Duration::from_millis(50));
		assert_eq!(counter.load(Ordering::SeqCst), before + 1);

		timer.cancel();
		timer.trigger();
		thread::sleep(Duration::from_millis(30));
		assert_eq!(counter.load(Ordering::SeqCst), before + 1);
	}
}
