use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::Cell;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Once;
use std::task::Context;
use std::task::Poll;

use futures::future::BoxFuture;
use pin_project_lite::pin_project;
use tracing::error;

use crate::error::GuardError;
use crate::interceptor::Interceptor;
use crate::interceptor::Request;
use crate::monitor::Monitor;
use crate::service::Next;
use crate::status::Status;

/// Longest backtrace logged for a recovered panic, in bytes.
pub const MAX_STACK_SIZE: usize = 4096;

thread_local! {
    // Polls of `CatchPanic` in progress on this thread.
    static CATCHING: Cell<usize> = const { Cell::new(0) };
    // Stack recorded by the panic hook for the innermost `CatchPanic` to pick up.
    static PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static STACK_HOOK: Once = Once::new();

/// Chains a panic hook that records the panicking thread's stack while a [`CatchPanic`] is
/// polling on it. Other panics go straight to the previous hook.
fn install_stack_hook() {
    STACK_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if CATCHING.try_with(Cell::get).unwrap_or(0) > 0 {
                let stack = Backtrace::force_capture().to_string();
                let _ = PANIC_STACK.try_with(|slot| {
                    if let Ok(mut slot) = slot.try_borrow_mut() {
                        *slot = Some(stack);
                    }
                });
            }
            previous(info);
        }));
    });
}

pin_project! {
    /// Resolves to `Err` if polling the inner future panics.
    #[derive(Debug)]
    pub struct CatchPanic<F> {
        #[pin]
        inner: F,
    }
}

impl<F> CatchPanic<F> {
    pub fn new(inner: F) -> Self {
        install_stack_hook();
        Self { inner }
    }
}

impl<F: Future> Future for CatchPanic<F> {
    type Output = Result<F::Output, CaughtPanic>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.project().inner;
        PANIC_STACK.with(|slot| slot.borrow_mut().take());
        CATCHING.with(|depth| depth.set(depth.get() + 1));
        let polled = catch_unwind(AssertUnwindSafe(|| inner.poll(cx)));
        CATCHING.with(|depth| depth.set(depth.get() - 1));

        match polled {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Err(payload) => {
                // Missing when another hook replaced ours after it was installed.
                let stack = PANIC_STACK
                    .with(|slot| slot.borrow_mut().take())
                    .unwrap_or_else(|| Backtrace::force_capture().to_string());
                Poll::Ready(Err(CaughtPanic {
                    payload,
                    stack: truncate(from_panic_site(&stack)),
                }))
            }
        }
    }
}

/// A panic caught by [`CatchPanic`].
pub struct CaughtPanic {
    payload: Box<dyn Any + Send>,
    stack: String,
}

impl CaughtPanic {
    pub fn message(&self) -> String {
        panic_message(self.payload.as_ref())
    }

    /// Backtrace of the panicking thread from the frame that panicked, at most
    /// [`MAX_STACK_SIZE`] bytes.
    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }
}

impl fmt::Debug for CaughtPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaughtPanic")
            .field("message", &self.message())
            .field("stack", &self.stack)
            .finish()
    }
}

/// The text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

fn is_frame_header(line: &str) -> bool {
    let line = line.trim_start();
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    digits > 0 && line[digits..].starts_with(':')
}

fn is_panic_machinery(header: &str) -> bool {
    ["panicking::", "rust_begin_unwind", "__rust_end_short_backtrace", "panic_fmt"]
        .iter()
        .any(|marker| header.contains(marker))
}

/// Drops the frames of the hook and the panic runtime above the frame that panicked. A
/// stack without recognisable panic frames is kept whole.
fn from_panic_site(stack: &str) -> &str {
    let mut offset = 0;
    let mut in_panic = false;
    for line in stack.split_inclusive('\n') {
        if is_frame_header(line) {
            if is_panic_machinery(line) {
                in_panic = true;
            } else if in_panic {
                return &stack[offset..];
            }
        }
        offset += line.len();
    }
    stack
}

fn truncate(stack: &str) -> String {
    let mut end = stack.len().min(MAX_STACK_SIZE);
    while !stack.is_char_boundary(end) {
        end -= 1;
    }
    stack[..end].to_owned()
}

/// Turns a panic anywhere further down the chain into an `Internal` status.
///
/// Without a monitor the panic is only logged. With one, it is also counted and reported
/// as an error of the method being called.
#[derive(Debug, Clone, Default)]
pub struct Recovery {
    monitor: Option<Arc<Monitor>>,
}

impl Recovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_monitor(mut self, monitor: Arc<Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    fn recover(&self, method: &str, caught: CaughtPanic) -> Status {
        let message = caught.message();
        error!(%method, panic = %message, stack = %caught.stack(), "panic in call handler");

        let status = Status::from(GuardError::Panicked(message));
        if let Some(monitor) = &self.monitor {
            let reported = catch_unwind(AssertUnwindSafe(|| {
                monitor.observe_error(method, &status);
            }));
            if let Err(payload) = reported {
                error!(
                    %method,
                    panic = %panic_message(payload.as_ref()),
                    "error reporter panicked"
                );
            }
        }
        status
    }
}

impl<T, U> Interceptor<T, U> for Recovery
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn intercept(
        self: Arc<Self>,
        request: Request<T>,
        next: Next<T, U>,
    ) -> BoxFuture<'static, Result<U, Status>> {
        Box::pin(async move {
            let method = request.info().method().to_owned();
            match CatchPanic::new(next.run(request)).await {
                Ok(response) => response,
                Err(caught) => Err(self.recover(&method, caught)),
            }
        })
    }
}
