//! Frame scheduling for render loops.
//!
//! [`run`] drives a callback once per display refresh through any
//! [`FrameSource`]. Everything here is single threaded: callbacks may capture
//! non-`Send` state such as a [`crate::PlaybackSession`].

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    rc::Rc,
    time::Duration,
};

use tokio::{task::JoinHandle, time::MissedTickBehavior};

/// Identifies a repeating callback registered with a [`FrameSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameToken(u64);

/// Host facility that invokes callbacks once per refresh.
pub trait FrameSource {
    fn schedule_repeating(&self, callback: Box<dyn FnMut()>) -> FrameToken;

    /// Unregisters `token`. Unknown or already cancelled tokens are ignored.
    fn cancel(&self, token: FrameToken);
}

/// Invokes `callback` once per refresh of `source` until the returned handle
/// is cancelled or dropped.
pub fn run<S>(source: &S, mut callback: impl FnMut() + 'static) -> FrameHandle
where
    S: FrameSource + Clone + 'static,
{
    let active = Rc::new(Cell::new(true));
    let guard = active.clone();

    let token = source.schedule_repeating(Box::new(move || {
        if guard.get() {
            callback();
        }
    }));

    let source = source.clone();
    FrameHandle {
        active,
        token,
        cancel: Some(Box::new(move |token| source.cancel(token))),
    }
}

/// Cancellation handle for a loop started with [`run`].
#[must_use = "dropping a FrameHandle cancels its frame loop"]
pub struct FrameHandle {
    active: Rc<Cell<bool>>,
    token: FrameToken,
    cancel: Option<Box<dyn FnOnce(FrameToken)>>,
}

impl FrameHandle {
    /// Stops the loop. No invocation starts after this returns, including one
    /// the source has already queued. Repeated calls do nothing.
    pub fn cancel(&mut self) {
        self.active.set(false);
        if let Some(cancel) = self.cancel.take() {
            cancel(self.token);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHandle")
            .field("token", &self.token)
            .field("active", &self.active.get())
            .finish()
    }
}

/// Frame source backed by a tokio interval on the current `LocalSet`.
///
/// Must be used from within [`tokio::task::LocalSet`]. A slow callback
/// delays the following frame; missed frames are neither queued nor replayed.
#[derive(Clone)]
pub struct IntervalFrameSource {
    period: Duration,
    next: Rc<Cell<u64>>,
    tasks: Rc<RefCell<HashMap<FrameToken, JoinHandle<()>>>>,
}

impl IntervalFrameSource {
    pub fn new(refresh_hz: u32) -> Self {
        Self {
            period: Duration::from_secs(1) / refresh_hz.max(1),
            next: Rc::new(Cell::new(0)),
            tasks: Rc::new(RefCell::new(HashMap::new())),
        }
    }
}

impl FrameSource for IntervalFrameSource {
    fn schedule_repeating(&self, mut callback: Box<dyn FnMut()>) -> FrameToken {
        let token = FrameToken(self.next.get());
        self.next.set(token.0 + 1);

        let period = self.period;
        let task = tokio::task::spawn_local(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                callback();
            }
        });

        self.tasks.borrow_mut().insert(token, task);
        token
    }

    fn cancel(&self, token: FrameToken) {
        if let Some(task) = self.tasks.borrow_mut().remove(&token) {
            task.abort();
        }
    }
}

impl fmt::Debug for IntervalFrameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntervalFrameSource")
            .field("period", &self.period)
            .field("tasks", &self.tasks.borrow().len())
            .finish()
    }
}

/// Frame source that refreshes only when [`ManualFrameSource::tick`] is called.
#[derive(Clone, Default)]
pub struct ManualFrameSource {
    inner: Rc<RefCell<ManualState>>,
}

#[derive(Default)]
struct ManualState {
    next: u64,
    callbacks: Vec<(FrameToken, Option<Box<dyn FnMut()>>)>,
}

impl ManualFrameSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.inner.borrow().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs one refresh: every callback registered before the tick is invoked
    /// once, unless it is cancelled before its turn. Returns the number of
    /// callbacks invoked.
    pub fn tick(&self) -> usize {
        let tokens: Vec<FrameToken> = self
            .inner
            .borrow()
            .callbacks
            .iter()
            .map(|(token, _)| *token)
            .collect();

        let mut invoked = 0;
        for token in tokens {
            let callback = self
                .inner
                .borrow_mut()
                .callbacks
                .iter_mut()
                .find(|(registered, _)| *registered == token)
                .and_then(|(_, callback)| callback.take());

            let Some(mut callback) = callback else {
                continue;
            };
            callback();
            invoked += 1;

            if let Some(slot) = self
                .inner
                .borrow_mut()
                .callbacks
                .iter_mut()
                .find(|(registered, _)| *registered == token)
            {
                slot.1 = Some(callback);
            }
        }

        invoked
    }
}

impl FrameSource for ManualFrameSource {
    fn schedule_repeating(&self, callback: Box<dyn FnMut()>) -> FrameToken {
        let mut state = self.inner.borrow_mut();
        let token = FrameToken(state.next);
        state.next += 1;
        state.callbacks.push((token, Some(callback)));
        token
    }

    fn cancel(&self, token: FrameToken) {
        self.inner
            .borrow_mut()
            .callbacks
            .retain(|(registered, _)| *registered != token);
    }
}

impl fmt::Debug for ManualFrameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualFrameSource")
            .field("callbacks", &self.len())
            .finish()
    }
}
