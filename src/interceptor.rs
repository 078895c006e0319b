//! Global error interceptor
//!
//! Installs a chained panic hook so uncaught panics anywhere in the host
//! (including panics inside spawned tokio tasks) are recorded in the audit log
//! before the previously installed hook runs. Panics are observed, never
//! suppressed.
//!
//! Panics that the core itself catches (a failing bus listener or module call)
//! run inside [`contain`] and are skipped by the hook, since the caller turns
//! them into their own audit entries.
//!
//! The hook only records. Subscribers of `audit.log` see the entry on the next
//! publish, never from inside the hook.

use crate::audit::{AuditInner, AuditKind, AuditLog};
use crate::error::panic_message;
use crate::lock_or_recover;
use once_cell::sync::Lazy;
use serde_json::json;
use std::cell::Cell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe, Location};
use std::pin::Pin;
use std::sync::{Mutex, Weak};
use std::task::{Context, Poll};

thread_local! {
    static CONTAINMENT_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Audit log receiving uncaught panics; replaced on every install
static TARGET: Lazy<Mutex<Option<Weak<AuditInner>>>> = Lazy::new(|| Mutex::new(None));

/// Whether the hook has been chained in already
static HOOK_INSTALLED: Lazy<Mutex<bool>> = Lazy::new(|| Mutex::new(false));

/// Run `f`, catching a panic as `Err` without reporting it as uncaught
pub(crate) fn contain<R>(f: impl FnOnce() -> R) -> std::thread::Result<R> {
    CONTAINMENT_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    CONTAINMENT_DEPTH.with(|depth| depth.set(depth.get() - 1));
    result
}

/// Future adapter that polls its inner future under [`contain`]
pub(crate) struct Contained<F>(F);

impl<F: Future + Unpin> Future for Contained<F> {
    type Output = std::thread::Result<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = &mut self.0;
        match contain(|| Pin::new(inner).poll(cx)) {
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

/// Async counterpart of [`contain`]; must not be polled again after a panic
pub(crate) fn contain_future<F: Future + Unpin>(future: F) -> Contained<F> {
    Contained(future)
}

fn is_contained() -> bool {
    CONTAINMENT_DEPTH.with(|depth| depth.get() > 0)
}

/// Process-wide panic interceptor
pub struct ErrorInterceptor;

impl ErrorInterceptor {
    /// Route uncaught panics into `audit`.
    ///
    /// The hook itself is installed once per process; later calls only switch
    /// the target log. Returns true when this call installed the hook.
    pub fn install(audit: &AuditLog) -> bool {
        *lock_or_recover(&TARGET) = Some(audit.downgrade());

        let mut installed = lock_or_recover(&HOOK_INSTALLED);
        if *installed {
            return false;
        }

        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if is_contained() {
                return;
            }
            Self::record(info.payload(), info.location());
            previous(info);
        }));
        *installed = true;
        tracing::debug!("Global panic interceptor installed");
        true
    }

    /// Stop recording into the current target; the hook stays chained
    pub fn detach() {
        *lock_or_recover(&TARGET) = None;
    }

    pub fn is_installed() -> bool {
        *lock_or_recover(&HOOK_INSTALLED)
    }

    fn record(payload: &(dyn std::any::Any + Send), location: Option<&Location<'_>>) {
        // try_lock: the panic may have happened while this thread held TARGET
        let target = match TARGET.try_lock() {
            Ok(guard) => guard.as_ref().and_then(Weak::upgrade),
            Err(_) => None,
        };
        let Some(inner) = target else {
            return;
        };

        let message = panic_message(payload);
        let location = location.map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
        let thread = std::thread::current().name().map(str::to_string);

        // Record only: a subscriber panicking inside the hook would abort
        AuditLog::from_inner(inner).try_log(
            AuditKind::Error,
            format!("Uncaught panic: {}", message),
            json!({
                "source": "panic",
                "message": message,
                "location": location,
                "thread": thread,
            }),
        );
    }
}
