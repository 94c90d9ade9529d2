//! Scoped panic recovery.
//!
//! [`catch`] runs a closure and turns a panic inside it into a
//! [`CaughtPanic`] carrying the panic message and a backtrace captured at
//! the panic site. [`catch_future`] does the same for every poll of a
//! future. Panics outside a guard reach the previously installed hook
//! unchanged.

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;
use std::task::Poll;

#[derive(Debug)]
pub struct CaughtPanic {
    pub message: String,
    pub backtrace: String,
}

thread_local! {
    static GUARD_DEPTH: Cell<usize> = const { Cell::new(0) };
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

fn install_hook() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if GUARD_DEPTH.with(Cell::get) == 0 {
                previous(info);
                return;
            }
            let backtrace = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
        }));
    });
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        GUARD_DEPTH.with(|d| d.set(d.get() + 1));
        DepthGuard
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        GUARD_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Run `f`, catching any panic it raises.
pub fn catch<T>(f: impl FnOnce() -> T) -> Result<T, CaughtPanic> {
    install_hook();
    let result = {
        let _depth = DepthGuard::enter();
        panic::catch_unwind(AssertUnwindSafe(f))
    };
    result.map_err(|payload| {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        let backtrace = LAST_BACKTRACE
            .with(|slot| slot.borrow_mut().take())
            .unwrap_or_default();
        CaughtPanic { message, backtrace }
    })
}

/// Drive `fut` to completion, catching a panic raised by any of its polls.
/// A future that panicked is dropped without being polled again.
pub async fn catch_future<F: Future>(fut: F) -> Result<F::Output, CaughtPanic> {
    let mut fut = std::pin::pin!(fut);
    std::future::poll_fn(|cx| match catch(|| fut.as_mut().poll(cx)) {
        Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
        Ok(Poll::Pending) => Poll::Pending,
        Err(caught) => Poll::Ready(Err(caught)),
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_passes_through() {
        assert_eq!(catch(|| 41 + 1).unwrap(), 42);
    }

    #[test]
    fn test_panic_is_caught_with_message_and_backtrace() {
        let caught = catch(|| -> i32 { panic!("bad shape: {}", 7) }).unwrap_err();
        assert_eq!(caught.message, "bad shape: 7");
        assert!(!caught.backtrace.is_empty());

        let caught = catch(|| {
            let v: Vec<i32> = Vec::new();
            v[3]
        })
        .unwrap_err();
        assert!(caught.message.contains("index out of bounds"));
    }

    #[test]
    fn test_nested_guards() {
        let outer = catch(|| {
            let inner = catch(|| panic!("inner"));
            assert!(inner.is_err());
            "outer ok"
        });
        assert_eq!(outer.unwrap(), "outer ok");
    }

    #[tokio::test]
    async fn test_future_panic_after_suspension() {
        let ok = catch_future(async {
            tokio::task::yield_now().await;
            7
        })
        .await;
        assert_eq!(ok.unwrap(), 7);

        let caught = catch_future(async {
            tokio::task::yield_now().await;
            if true {
                panic!("lost connection state");
            }
        })
        .await
        .unwrap_err();
        assert_eq!(caught.message, "lost connection state");
        assert!(!caught.backtrace.is_empty());
    }
}
