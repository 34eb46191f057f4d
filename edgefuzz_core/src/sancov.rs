//! `-fsanitize-coverage=trace-pc-guard` entry points.
//!
//! The exported callbacks forward into a [`CoverageCollector`] installed on the calling
//! thread. With no collector installed they do nothing, so an instrumented binary can
//! run outside a fuzzing session. The hooks never log: errors they cannot hand to an
//! open run are counted on the collector (see [`CoverageCollector::stray_errors`]).

use crate::coverage::{CoverageCollector, CoverageError};
use crate::guard::{Guard, SiteLocation};
use std::cell::RefCell;

thread_local! {
    static ACTIVE: RefCell<Option<CoverageCollector>> = const { RefCell::new(None) };
}

/// Installs `collector` for the current thread, returning the one it replaces.
pub fn install(collector: CoverageCollector) -> Option<CoverageCollector> {
    ACTIVE.with(|slot| slot.borrow_mut().replace(collector))
}

/// Removes and returns the current thread's collector.
pub fn uninstall() -> Option<CoverageCollector> {
    ACTIVE.with(|slot| slot.borrow_mut().take())
}

/// Runs `f` on the installed collector.
///
/// Returns `None` if no collector is installed, or if the call re-enters from inside
/// another `with_active` on the same thread.
pub fn with_active<R>(f: impl FnOnce(&mut CoverageCollector) -> R) -> Option<R> {
    ACTIVE
        .try_with(|slot| {
            let mut active = slot.try_borrow_mut().ok()?;
            active.as_mut().map(f)
        })
        .ok()
        .flatten()
}

/// Called by the sanitizer runtime once per instrumented module.
///
/// Each guard slot's address is registered as a site and the assigned guard id is
/// written back into the slot.
///
/// # Safety
/// `start..stop` must be the module's guard table as laid out by the compiler.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard_init(start: *mut u32, stop: *mut u32) {
    if start.is_null() || start == stop {
        return;
    }
    // Tables are initialised once, even if the runtime calls us again.
    if unsafe { *start } != 0 {
        return;
    }

    let _ = with_active(|collector| {
        let mut slot = start;
        while slot < stop {
            match collector.register_site(slot as usize as SiteLocation) {
                Ok(guard) => unsafe { *slot = guard.id() },
                Err(error) => {
                    collector.note_stray_error(error);
                    break;
                }
            }
            slot = unsafe { slot.add(1) };
        }
    });
}

/// Called by instrumented code on every edge.
///
/// # Safety
/// `guard` must point into a guard table passed to
/// [`__sanitizer_cov_trace_pc_guard_init`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard(guard: *mut u32) {
    if guard.is_null() {
        return;
    }
    let id = unsafe { *guard };
    if id == 0 {
        return;
    }
    // Errors during a run land in its failure slot.
    let _ = with_active(|collector| {
        if let Err(error @ CoverageError::NoOpenRun) = collector.on_edge(Guard::from_raw(id)) {
            collector.note_stray_error(error);
        }
    });
}
