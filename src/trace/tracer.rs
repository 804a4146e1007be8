//! The span-creation API.

use crate::context::Context;
use crate::trace::provider::TracerProvider;
use crate::trace::{Span, SpanContext, SpanId};
use std::borrow::Cow;

/// Creates spans, parenting them from the active context.
///
/// Tracers are cheap handles onto their [`TracerProvider`] and can be
/// cloned freely.
#[derive(Clone, Debug)]
pub struct Tracer {
    provider: TracerProvider,
}

impl Tracer {
    pub(crate) fn new(provider: TracerProvider) -> Self {
        Tracer { provider }
    }

    /// Starts a new span, using the current thread's context for parenting.
    ///
    /// If the current context holds an active span, the new span joins its
    /// trace and records it as parent; otherwise a new trace is started.
    pub fn start(&self, name: impl Into<Cow<'static, str>>) -> Span {
        Context::map_current(|cx| self.start_with_context(name, cx))
    }

    /// Starts a new span, parented from the given context.
    pub fn start_with_context(&self, name: impl Into<Cow<'static, str>>, cx: &Context) -> Span {
        if self.provider.is_shutdown() {
            // spans created after shutdown are inert and never exported
            return Span::new_noop(self.provider.clone());
        }

        let parent = cx.span().span_context().clone();
        let (trace_id, parent_span_id) = if parent.is_valid() {
            (parent.trace_id(), parent.span_id())
        } else {
            (self.provider.config().id_generator.new_trace_id(), SpanId::INVALID)
        };
        let span_id = self.provider.config().id_generator.new_span_id();

        Span::new(
            SpanContext::new(trace_id, span_id),
            parent_span_id,
            name.into(),
            self.provider.clone(),
        )
    }

    /// Starts a span, makes it the active span for the duration of `f`, and
    /// ends it when `f` returns.
    ///
    /// The span ends on every exit path: if `f` panics, the context guard
    /// and span are dropped during unwinding, which ends the span and
    /// restores the prior context before the panic continues.
    pub fn in_span<T, F>(&self, name: impl Into<Cow<'static, str>>, f: F) -> T
    where
        F: FnOnce(Context) -> T,
    {
        let span = self.start(name);
        let cx = Context::current_with_span(span);
        let _guard = cx.clone().attach();
        let result = f(cx.clone());
        cx.span().end();
        result
    }
}
