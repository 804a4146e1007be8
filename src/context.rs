//! Execution-scoped propagation of the active span.
//!
//! A [`Context`] carries the currently active span for one logical unit of
//! execution so that nested code can read and annotate it without explicit
//! parameter threading. The current context is stored per thread; attaching
//! a context returns a [`ContextGuard`] that restores the previous context
//! when dropped, on every exit path including panics. Concurrent requests
//! therefore never observe each other's active span.
//!
//! For task-based concurrency, [`FutureExt::with_context`] re-attaches a
//! captured context around every poll so the active span follows the task
//! across `.await` points and worker threads.

use crate::error::TelemetryResult;
use crate::trace::{Span, SpanContext, Status};
use crate::KeyValue;
use pin_project_lite::pin_project;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

thread_local! {
    static CURRENT_CONTEXT: RefCell<Context> = RefCell::new(Context::default());
}

const NOOP_SPAN: ActiveSpan = ActiveSpan {
    span_context: SpanContext::NONE,
    inner: None,
};

/// An execution-scoped carrier for the active span.
///
/// Contexts are immutable; associating a span produces a new context. The
/// context for the current thread is read with [`Context::current`] and
/// replaced with [`Context::attach`].
#[derive(Clone, Default)]
pub struct Context {
    pub(crate) span: Option<Arc<ActiveSpan>>,
}

/// The span held by a [`Context`], synchronized for shared access.
///
/// When the last context clone referencing the span is dropped, the span is
/// dropped too, which ends it if nothing ended it explicitly.
pub(crate) struct ActiveSpan {
    span_context: SpanContext,
    inner: Option<Mutex<Span>>,
}

impl From<Span> for ActiveSpan {
    fn from(span: Span) -> Self {
        ActiveSpan {
            span_context: span.span_context().clone(),
            inner: Some(Mutex::new(span)),
        }
    }
}

impl Context {
    /// Creates an empty `Context` with no active span.
    pub fn new() -> Self {
        Context::default()
    }

    /// Returns a snapshot of the current thread's context.
    pub fn current() -> Self {
        Context::map_current(|cx| cx.clone())
    }

    /// Applies a function to the current context, returning its value.
    ///
    /// Cheaper than [`Context::current`] when only a read is needed. Do not
    /// attach another context from inside `f`; the current one is borrowed.
    pub fn map_current<T>(f: impl FnOnce(&Context) -> T) -> T {
        CURRENT_CONTEXT.with(|cx| f(&cx.borrow()))
    }

    /// Returns a clone of the current thread's context with the given span
    /// set as active.
    pub fn current_with_span(span: Span) -> Self {
        Context::current().with_span(span)
    }

    /// Returns a copy of this context with the given span set as active.
    pub fn with_span(&self, span: Span) -> Self {
        Context {
            span: Some(Arc::new(ActiveSpan::from(span))),
        }
    }

    /// Returns a reference to this context's span, or a no-op span if none
    /// is active.
    pub fn span(&self) -> SpanRef<'_> {
        match self.span.as_ref() {
            Some(span) => SpanRef(span),
            None => SpanRef(&NOOP_SPAN),
        }
    }

    /// Returns whether a span is active in this context.
    pub fn has_active_span(&self) -> bool {
        self.span.is_some()
    }

    /// Replaces the current thread's context with this one.
    ///
    /// Dropping the returned [`ContextGuard`] restores the previous
    /// context, so nested scopes unwind correctly even on failure.
    pub fn attach(self) -> ContextGuard {
        let previous_cx = CURRENT_CONTEXT
            .try_with(|current| current.replace(self))
            .ok();

        ContextGuard {
            previous_cx,
            _marker: PhantomData,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("span", &self.span.as_ref().map(|s| &s.span_context))
            .finish()
    }
}

/// A reference to the span active in a [`Context`].
///
/// Mutations go through an internal mutex so that the span can be shared
/// between the owning scope and, e.g., a log correlator reading its ids.
#[derive(Debug)]
pub struct SpanRef<'a>(&'a ActiveSpan);

impl SpanRef<'_> {
    fn with_inner_mut<T>(&self, f: impl FnOnce(&mut Span) -> TelemetryResult<T>) -> TelemetryResult<Option<T>> {
        match self.0.inner.as_ref() {
            Some(inner) => {
                let mut span = inner.lock()?;
                f(&mut span).map(Some)
            }
            None => Ok(None),
        }
    }

    /// The [`SpanContext`] of the referenced span.
    pub fn span_context(&self) -> &SpanContext {
        &self.0.span_context
    }

    /// Returns `true` if the referenced span is still open.
    pub fn is_recording(&self) -> bool {
        self.0
            .inner
            .as_ref()
            .and_then(|inner| inner.lock().ok().map(|span| span.is_recording()))
            .unwrap_or(false)
    }

    /// Set an attribute on the referenced span.
    ///
    /// Fails with [`TelemetryError::InvalidState`] if the span has ended.
    ///
    /// [`TelemetryError::InvalidState`]: crate::TelemetryError::InvalidState
    pub fn set_attribute(&self, attribute: KeyValue) -> TelemetryResult<()> {
        self.with_inner_mut(|span| span.set_attribute(attribute))
            .map(|_| ())
    }

    /// Set the status of the referenced span.
    pub fn set_status(&self, status: Status) -> TelemetryResult<()> {
        self.with_inner_mut(|span| span.set_status(status))
            .map(|_| ())
    }

    /// End the referenced span now. Ending twice is a no-op.
    pub fn end(&self) {
        let _ = self.with_inner_mut(|span| {
            span.end();
            Ok(())
        });
    }
}

impl fmt::Debug for ActiveSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSpan")
            .field("span_context", &self.span_context)
            .finish()
    }
}

/// A guard that resets the current context to the prior context when
/// dropped.
#[allow(missing_debug_implementations)]
pub struct ContextGuard {
    previous_cx: Option<Context>,
    // ensure this type is !Send as it relies on thread locals
    _marker: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous_cx) = self.previous_cx.take() {
            let _ = CURRENT_CONTEXT.try_with(|current| current.replace(previous_cx));
        }
    }
}

pin_project! {
    /// A future that re-attaches an associated [`Context`] on every poll.
    #[derive(Debug)]
    pub struct WithContext<T> {
        #[pin]
        inner: T,
        cx: Context,
    }
}

impl<T: std::future::Future> std::future::Future for WithContext<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = this.cx.clone().attach();

        this.inner.poll(task_cx)
    }
}

/// Extension trait allowing futures to carry a telemetry [`Context`].
pub trait FutureExt: Sized {
    /// Attaches the provided [`Context`] to this future, making it the
    /// current context whenever the future is polled.
    fn with_context(self, cx: Context) -> WithContext<Self> {
        WithContext { inner: self, cx }
    }

    /// Attaches the current [`Context`] to this future.
    fn with_current_context(self) -> WithContext<Self> {
        let cx = Context::current();
        self.with_context(cx)
    }
}

impl<T: Sized> FutureExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TracerProvider;

    fn test_tracer() -> crate::trace::Tracer {
        TracerProvider::builder().build().tracer()
    }

    #[test]
    fn empty_context_has_noop_span() {
        let cx = Context::new();
        assert!(!cx.has_active_span());
        assert!(!cx.span().is_recording());
        assert_eq!(*cx.span().span_context(), SpanContext::NONE);
    }

    #[test]
    fn nested_scopes_restore_prior_span() {
        let tracer = test_tracer();
        let outer = tracer.start("outer");
        let outer_id = outer.span_context().span_id();

        let _outer_guard = Context::current_with_span(outer).attach();
        assert_eq!(
            Context::current().span().span_context().span_id(),
            outer_id
        );

        {
            let inner = tracer.start("inner");
            let inner_id = inner.span_context().span_id();
            let _inner_guard = Context::current_with_span(inner).attach();
            assert_eq!(
                Context::current().span().span_context().span_id(),
                inner_id
            );
        }

        // inner guard dropped, outer span is current again
        assert_eq!(
            Context::current().span().span_context().span_id(),
            outer_id
        );
    }

    #[test]
    fn scope_restored_after_panic() {
        let tracer = test_tracer();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let span = tracer.start("doomed");
            let _guard = Context::current_with_span(span).attach();
            panic!("operation failed");
        }));
        assert!(result.is_err());
        assert!(!Context::current().has_active_span());
    }

    #[test]
    fn with_context_future_carries_span() {
        let tracer = test_tracer();
        let span = tracer.start("async-op");
        let trace_id = span.span_context().trace_id();
        let cx = Context::new().with_span(span);

        let observed = futures_executor::block_on(
            async { Context::current().span().span_context().trace_id() }.with_context(cx),
        );
        assert_eq!(observed, trace_id);
        assert!(!Context::current().has_active_span());
    }
}
