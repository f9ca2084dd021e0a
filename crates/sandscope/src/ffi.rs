//! C FFI for native interceptors
//!
//! This module exposes the arbiter to a file-system interceptor written in
//! C or C++ that links the static or dynamic library.

use std::cell::RefCell;
use std::ffi::{CStr, CString, c_char};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use crate::access::{AccessDecision, AccessRequest, DecisionReason, Operation};
use crate::accounting::IoCounters;
use crate::arbiter::{AccessArbiter, panic_message};
use crate::config::{ManifestConfig, ManifestLoadError};

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    let _ = LAST_ERROR.try_with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

/// Decision returned to the interceptor
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandscopeDecision {
    /// Non-zero if the access may proceed
    pub allowed: u8,
    /// Non-zero if the access was reported
    pub reported: u8,
    /// Non-zero if no rule covered the access
    pub unexpected: u8,
    /// Diagnostic reason code
    pub reason: u8,
    /// Depth of the deepest rule that shaped the policy
    pub matched_depth: u16,
}

impl From<AccessDecision> for SandscopeDecision {
    fn from(decision: AccessDecision) -> Self {
        Self {
            allowed: u8::from(decision.allowed),
            reported: u8::from(decision.reported),
            unexpected: u8::from(decision.unexpected),
            reason: decision.reason as u8,
            matched_depth: decision.matched_depth,
        }
    }
}

/// Opaque handle to an access arbiter
#[derive(Debug)]
pub struct SandscopeArbiter {
    arbiter: AccessArbiter,
}

/// Get the last error message (thread-local)
///
/// # Safety
/// Returns a pointer to a thread-local string. The pointer is valid
/// until the next FFI call on the same thread.
#[unsafe(no_mangle)]
pub extern "C" fn sandscope_last_error() -> *const c_char {
    LAST_ERROR
        .try_with(|e| e.borrow().as_ref().map(|s| s.as_ptr()).unwrap_or(ptr::null()))
        .unwrap_or(ptr::null())
}

/// Create an arbiter from a JSON manifest document.
///
/// Returns a pointer to the arbiter on success, or null on failure.
/// On failure, call `sandscope_last_error()` to get the error message.
///
/// # Safety
/// - `manifest_json` must be a valid null-terminated C string.
/// - The returned pointer must be freed with `sandscope_arbiter_free()`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sandscope_arbiter_new(manifest_json: *const c_char) -> *mut SandscopeArbiter {
    if manifest_json.is_null() {
        set_last_error("manifest_json is null");
        return ptr::null_mut();
    }

    // SAFETY: checked non-null above; caller guarantees NUL termination
    let json = match unsafe { CStr::from_ptr(manifest_json) }.to_str() {
        Ok(s) => s,
        Err(e) => {
            set_last_error(&format!("invalid UTF-8 in manifest: {}", e));
            return ptr::null_mut();
        }
    };

    let parts = ManifestConfig::from_json(json)
        .and_then(|config| config.into_parts().map_err(ManifestLoadError::from));
    match parts {
        Ok((tree, config)) => {
            tracing::debug!(
                pip_id = config.pip_id,
                nodes = tree.node_count(),
                "created access arbiter"
            );
            let arbiter = AccessArbiter::new(tree, config);
            Box::into_raw(Box::new(SandscopeArbiter { arbiter }))
        }
        Err(e) => {
            set_last_error(&format!("failed to load manifest: {}", e));
            ptr::null_mut()
        }
    }
}

/// Free an arbiter.
///
/// # Safety
/// - `arbiter` must be a pointer returned by `sandscope_arbiter_new()`.
/// - The pointer must not be used after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sandscope_arbiter_free(arbiter: *mut SandscopeArbiter) {
    if !arbiter.is_null() {
        // SAFETY: caller guarantees this came from sandscope_arbiter_new
        unsafe { drop(Box::from_raw(arbiter)) };
    }
}

/// Arbitrate one intercepted access.
///
/// `operation` is an operation code (0 read, 1 write, 2 probe, 3 enumerate,
/// 4 delete, 5 rename, 6 create directory). `parent_process_id` of 0 means
/// unknown. Returns 0 on success. On invalid arguments or an internal panic
/// returns -1, sets the last error and, if `out` is non-null, stores a denied
/// decision.
///
/// # Safety
/// - `arbiter` must be a valid pointer from `sandscope_arbiter_new()`.
/// - `path` must be a valid null-terminated C string.
/// - `out` must be a valid pointer to a `SandscopeDecision`.
#[unsafe(no_mangle)]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn sandscope_arbitrate(
    arbiter: *const SandscopeArbiter,
    path: *const c_char,
    operation: u8,
    process_id: u32,
    parent_process_id: u32,
    bytes: u64,
    target_exists: u8,
    out: *mut SandscopeDecision,
) -> i32 {
    if out.is_null() {
        set_last_error("out is null");
        return -1;
    }

    let result = contain_panic(|| {
        if arbiter.is_null() {
            return Err("arbiter is null".to_string());
        }
        if path.is_null() {
            return Err("path is null".to_string());
        }

        // SAFETY: checked non-null above; caller guarantees validity
        let arbiter = unsafe { &(*arbiter).arbiter };

        // SAFETY: checked non-null above; caller guarantees NUL termination
        let path = unsafe { CStr::from_ptr(path) }
            .to_str()
            .map_err(|e| format!("invalid UTF-8 in path: {}", e))?;
        let operation = Operation::from_code(operation)
            .ok_or_else(|| format!("unknown operation code {}", operation))?;

        let mut request = AccessRequest::new(path, operation, process_id).with_bytes(bytes);
        if parent_process_id != 0 {
            request = request.with_parent(parent_process_id);
        }
        if target_exists == 0 {
            request = request.nonexistent();
        }
        Ok(arbiter.arbitrate(&request))
    });

    let (rc, decision) = match result {
        Ok(decision) => (0, decision),
        Err(msg) => {
            set_last_error(&msg);
            (-1, AccessDecision::fail_closed(DecisionReason::InternalFault))
        }
    };
    // SAFETY: checked non-null above
    unsafe { out.write(decision.into()) };
    rc
}

/// Run `body`, turning a panic into an error so it never unwinds into C.
fn contain_panic<T>(body: impl FnOnce() -> Result<T, String>) -> Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(payload) => Err(format!("arbitration panicked: {}", panic_message(&*payload))),
    }
}

/// Record a process and its parent (0 for none).
///
/// # Safety
/// - `arbiter` must be a valid pointer from `sandscope_arbiter_new()`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sandscope_register_process(
    arbiter: *const SandscopeArbiter,
    process_id: u32,
    parent_process_id: u32,
) {
    if arbiter.is_null() {
        set_last_error("arbiter is null");
        return;
    }
    // SAFETY: checked non-null above
    let arbiter = unsafe { &(*arbiter).arbiter };
    arbiter.register_process(process_id, (parent_process_id != 0).then_some(parent_process_id));
}

/// Write the aggregated I/O counters of a process tree into `out`.
///
/// `out_len` must be 48. The layout is six little-endian u64 values: read
/// operations, read bytes, write operations, write bytes, other operations,
/// other bytes. Returns 0 on success, -1 on error.
///
/// # Safety
/// - `arbiter` must be a valid pointer from `sandscope_arbiter_new()`.
/// - `out` must be a valid pointer to `out_len` writable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sandscope_aggregate_counters(
    arbiter: *const SandscopeArbiter,
    root_process_id: u32,
    out: *mut u8,
    out_len: usize,
) -> i32 {
    if arbiter.is_null() || out.is_null() {
        set_last_error("arbiter or out is null");
        return -1;
    }
    if out_len != IoCounters::ENCODED_LEN {
        set_last_error(&format!(
            "counter buffer must be {} bytes, got {}",
            IoCounters::ENCODED_LEN,
            out_len
        ));
        return -1;
    }

    // SAFETY: checked non-null above
    let arbiter = unsafe { &(*arbiter).arbiter };
    let bytes = arbiter.aggregate_counters(root_process_id).to_bytes();
    // SAFETY: caller guarantees out points to out_len bytes, checked equal to bytes.len()
    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), out, bytes.len()) };
    0
}

/// Stop admitting accesses; later calls are denied and reported.
///
/// # Safety
/// - `arbiter` must be a valid pointer from `sandscope_arbiter_new()`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sandscope_begin_teardown(arbiter: *const SandscopeArbiter) {
    if arbiter.is_null() {
        set_last_error("arbiter is null");
        return;
    }
    // SAFETY: checked non-null above
    unsafe { &(*arbiter).arbiter }.begin_teardown();
}
