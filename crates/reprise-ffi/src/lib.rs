//! C FFI surface for reprise.
//!
//! Pattern: opaque EngineHandle + C strings + JSON serialization.
//! Method calls go through one entry point taking the method name and a
//! JSON argument map, mirroring a method channel. Event channels are
//! polled: `reprise_listen` attaches a buffer to a player and
//! `reprise_poll_events` drains it.
//!
//! Flutter/Dart calls these via `dart:ffi`. Any platform with C FFI
//! (Swift, Kotlin, Python, Node.js) can use this.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::sync::Arc;

use nine_s_shell::Shell;
use parking_lot::Mutex;
use reprise_core::sink::BufferDelegate;
use reprise_core::{Engine, MethodCall, PluginError};

// ---------------------------------------------------------------------------
// Error handling (thread-local last error)
// ---------------------------------------------------------------------------

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn set_error(msg: String) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(msg));
}

fn clear_error() {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = None);
}

/// Returns the last error message (caller frees with `reprise_string_free`).
///
/// Errors from `reprise_method_call` are `{code, message, details}` JSON.
#[no_mangle]
pub extern "C" fn reprise_last_error() -> *mut c_char {
    LAST_ERROR.with(|cell| {
        cell.borrow_mut()
            .take()
            .and_then(|s| CString::new(s).ok())
            .map(|s| s.into_raw())
            .unwrap_or(ptr::null_mut())
    })
}

/// Frees a string returned from reprise FFI.
///
/// # Safety
/// Must be a pointer returned from this FFI and not already freed.
#[no_mangle]
pub unsafe extern "C" fn reprise_string_free(ptr: *mut c_char) {
    if !ptr.is_null() {
        let _ = CString::from_raw(ptr);
    }
}

// ---------------------------------------------------------------------------
// Opaque handle
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct EngineHandle {
    _private: [u8; 0],
}

struct EngineHandleInner {
    engine: Engine,
    /// Event buffers of listening players, keyed by player id.
    listeners: Mutex<HashMap<String, Arc<BufferDelegate>>>,
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Sets the 9S storage root directory.
///
/// # Safety
/// `path` must be a valid null-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn reprise_set_root(path: *const c_char) -> i32 {
    clear_error();
    match read_cstr(path) {
        Ok(p) => {
            std::env::set_var("NINE_S_ROOT", p);
            1
        }
        Err(e) => {
            set_error(e);
            0
        }
    }
}

/// Opens the reprise engine and starts its threads. Returns an opaque handle.
///
/// # Safety
/// `app_id` must be a valid null-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn reprise_open(app_id: *const c_char) -> *mut EngineHandle {
    clear_error();
    let app = match read_cstr(app_id) {
        Ok(a) => a,
        Err(e) => {
            set_error(e);
            return ptr::null_mut();
        }
    };

    match Shell::open(&app, &[]) {
        Ok(shell) => {
            let engine = Engine::new(shell);
            engine.start();
            let inner = EngineHandleInner {
                engine,
                listeners: Mutex::new(HashMap::new()),
            };
            Box::into_raw(Box::new(inner)) as *mut EngineHandle
        }
        Err(e) => {
            set_error(e.to_string());
            ptr::null_mut()
        }
    }
}

/// Closes the engine: disposes every player and stops downloads.
#[no_mangle]
pub extern "C" fn reprise_close(handle: *mut EngineHandle) {
    if !handle.is_null() {
        unsafe {
            let inner = Box::from_raw(handle as *mut EngineHandleInner);
            inner.engine.shutdown();
        }
    }
}

/// Write engine settings. Takes effect on the next `reprise_open`.
/// Returns 1 on success, 0 on error.
#[no_mangle]
pub extern "C" fn reprise_configure(handle: *mut EngineHandle, json: *const c_char) -> i32 {
    clear_error();
    let inner = match inner_ref(handle) {
        Ok(i) => i,
        Err(e) => return err_zero(e),
    };
    let value = match read_json(json) {
        Ok(v) => v,
        Err(e) => return err_zero(e),
    };
    match inner
        .engine
        .shell()
        .put(reprise_core::paths::SETTINGS_ENGINE, value)
    {
        Ok(_) => 1,
        Err(e) => err_zero(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Method calls
// ---------------------------------------------------------------------------

/// Dispatch one method call. `args_json` may be NULL for calls without
/// arguments.
///
/// Returns the result JSON (caller frees; `null` for calls without a
/// result), or NULL with the error payload in `reprise_last_error`.
#[no_mangle]
pub extern "C" fn reprise_method_call(
    handle: *mut EngineHandle,
    method: *const c_char,
    args_json: *const c_char,
) -> *mut c_char {
    clear_error();
    let inner = match inner_ref(handle) {
        Ok(i) => i,
        Err(e) => return err_null(e),
    };
    let method = match read_cstr(method) {
        Ok(m) => m,
        Err(e) => return err_null(e),
    };
    let args = if args_json.is_null() {
        serde_json::Value::Null
    } else {
        match read_json(args_json) {
            Ok(v) => v,
            Err(e) => return err_null(e),
        }
    };

    let call = MethodCall::new(&method, args);
    match inner.engine.handle(&call) {
        Ok(result) => {
            if call.method == "dispose" || call.method == "init" {
                forget_listeners(inner, &call);
            }
            json_to_cstr(&result)
        }
        Err(e) => err_plugin(&e),
    }
}

// ---------------------------------------------------------------------------
// Event channels
// ---------------------------------------------------------------------------

/// Start buffering a player's events. Anything emitted before this call is
/// delivered on the first poll. Returns 1 on success, 0 on error.
#[no_mangle]
pub extern "C" fn reprise_listen(handle: *mut EngineHandle, player_id: *const c_char) -> i32 {
    clear_error();
    let inner = match inner_ref(handle) {
        Ok(i) => i,
        Err(e) => return err_zero(e),
    };
    let id = match read_cstr(player_id) {
        Ok(s) => s,
        Err(e) => return err_zero(e),
    };
    let buffer = Arc::new(BufferDelegate::new());
    match inner.engine.listen(&id, Arc::clone(&buffer) as _) {
        Ok(()) => {
            inner.listeners.lock().insert(id, buffer);
            1
        }
        Err(e) => {
            err_plugin(&e);
            0
        }
    }
}

/// Stop listening. Later events queue inside the player until the next
/// `reprise_listen`. Returns 1 on success, 0 on error.
#[no_mangle]
pub extern "C" fn reprise_cancel(handle: *mut EngineHandle, player_id: *const c_char) -> i32 {
    clear_error();
    let inner = match inner_ref(handle) {
        Ok(i) => i,
        Err(e) => return err_zero(e),
    };
    let id = match read_cstr(player_id) {
        Ok(s) => s,
        Err(e) => return err_zero(e),
    };
    inner.listeners.lock().remove(&id);
    match inner.engine.cancel(&id) {
        Ok(()) => 1,
        Err(e) => {
            err_plugin(&e);
            0
        }
    }
}

/// Drain buffered events of a listening player. Returns a JSON array of
/// messages (caller frees), empty when nothing arrived.
#[no_mangle]
pub extern "C" fn reprise_poll_events(handle: *mut EngineHandle, player_id: *const c_char) -> *mut c_char {
    clear_error();
    let inner = match inner_ref(handle) {
        Ok(i) => i,
        Err(e) => return err_null(e),
    };
    let id = match read_cstr(player_id) {
        Ok(s) => s,
        Err(e) => return err_null(e),
    };
    let buffer = match inner.listeners.lock().get(&id).cloned() {
        Some(b) => b,
        None => return err_null(format!("player {} is not being listened to", id)),
    };
    let messages: Vec<serde_json::Value> = buffer.drain().iter().map(|m| m.to_value()).collect();
    json_to_cstr(&messages)
}

// ---------------------------------------------------------------------------
// Downloads
// ---------------------------------------------------------------------------

/// All known downloads, oldest first. Returns JSON array (caller frees).
#[no_mangle]
pub extern "C" fn reprise_downloads(handle: *mut EngineHandle) -> *mut c_char {
    clear_error();
    let inner = match inner_ref(handle) {
        Ok(i) => i,
        Err(e) => return err_null(e),
    };
    json_to_cstr(&inner.engine.downloads().downloads())
}

/// Pause (`paused != 0`) or resume the download queue. A paused transfer
/// keeps its partial file and resumes from it.
#[no_mangle]
pub extern "C" fn reprise_set_downloads_paused(handle: *mut EngineHandle, paused: i32) -> i32 {
    clear_error();
    let inner = match inner_ref(handle) {
        Ok(i) => i,
        Err(e) => return err_zero(e),
    };
    if paused != 0 {
        inner.engine.downloads().pause_downloads();
    } else {
        inner.engine.downloads().resume_downloads();
    }
    1
}

/// Read a scroll at any path. Returns JSON (caller frees), or NULL if not found.
#[no_mangle]
pub extern "C" fn reprise_read(handle: *mut EngineHandle, path: *const c_char) -> *mut c_char {
    clear_error();
    let inner = match inner_ref(handle) {
        Ok(i) => i,
        Err(e) => return err_null(e),
    };
    let path_str = match read_cstr(path) {
        Ok(s) => s,
        Err(e) => return err_null(e),
    };
    match inner.engine.shell().get(&path_str) {
        Ok(Some(scroll)) => json_to_cstr(&scroll),
        Ok(None) => ptr::null_mut(),
        Err(e) => err_null(e.to_string()),
    }
}

/// List paths under a prefix. Returns JSON array (caller frees).
#[no_mangle]
pub extern "C" fn reprise_list(handle: *mut EngineHandle, prefix: *const c_char) -> *mut c_char {
    clear_error();
    let inner = match inner_ref(handle) {
        Ok(i) => i,
        Err(e) => return err_null(e),
    };
    let prefix_str = match read_cstr(prefix) {
        Ok(s) => s,
        Err(e) => return err_null(e),
    };
    match inner.engine.shell().all(&prefix_str) {
        Ok(paths) => json_to_cstr(&paths),
        Err(e) => err_null(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Returns the FFI API version.
#[no_mangle]
pub extern "C" fn reprise_version() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn inner_ref<'a>(handle: *mut EngineHandle) -> Result<&'a EngineHandleInner, String> {
    if handle.is_null() {
        return Err("null engine handle".into());
    }
    Ok(unsafe { &*(handle as *mut EngineHandleInner) })
}

/// Drop event buffers of players the call disposed.
fn forget_listeners(inner: &EngineHandleInner, call: &MethodCall) {
    let mut listeners = inner.listeners.lock();
    match call.args["playerId"].as_str() {
        Some(id) if call.method == "dispose" => {
            listeners.remove(id);
        }
        _ => listeners.clear(),
    }
}

fn read_cstr(ptr: *const c_char) -> Result<String, String> {
    if ptr.is_null() {
        return Err("null string pointer".into());
    }
    unsafe {
        CStr::from_ptr(ptr)
            .to_str()
            .map(String::from)
            .map_err(|_| "invalid utf-8".into())
    }
}

fn read_json(ptr: *const c_char) -> Result<serde_json::Value, String> {
    let s = read_cstr(ptr)?;
    serde_json::from_str(&s).map_err(|e| e.to_string())
}

fn json_to_cstr<T: serde::Serialize>(value: &T) -> *mut c_char {
    match serde_json::to_string(value) {
        Ok(json) => to_cstr(json),
        Err(e) => err_null(e.to_string()),
    }
}

fn to_cstr(s: String) -> *mut c_char {
    CString::new(s)
        .map(|c| c.into_raw())
        .unwrap_or(ptr::null_mut())
}

fn err_null(msg: String) -> *mut c_char {
    set_error(msg);
    ptr::null_mut()
}

fn err_zero(msg: String) -> i32 {
    set_error(msg);
    0
}

fn err_plugin(e: &PluginError) -> *mut c_char {
    err_null(e.to_value().to_string())
}

// ---------------------------------------------------------------------------
// FFI Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::ffi::CString;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    /// Open an engine via FFI in a temp directory. Returns (dir, handle, guard).
    fn ffi_engine(app: &str) -> (TempDir, *mut EngineHandle, parking_lot::MutexGuard<'static, ()>) {
        let guard = ENV_LOCK.lock();
        let dir = TempDir::new().expect("tempdir");
        let root = CString::new(dir.path().to_str().unwrap()).unwrap();
        let app_c = CString::new(app).unwrap();
        unsafe {
            reprise_set_root(root.as_ptr());
            let handle = reprise_open(app_c.as_ptr());
            assert!(!handle.is_null(), "reprise_open returned null");
            (dir, handle, guard)
        }
    }

    /// Read a *mut c_char into a String and free it.
    fn read_ffi_string(ptr: *mut c_char) -> String {
        assert!(!ptr.is_null(), "FFI returned null string");
        let s = unsafe { CStr::from_ptr(ptr).to_str().unwrap().to_string() };
        unsafe { reprise_string_free(ptr) };
        s
    }

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    fn call(handle: *mut EngineHandle, method: &str, args: &str) -> *mut c_char {
        let method = c(method);
        let args = c(args);
        reprise_method_call(handle, method.as_ptr(), args.as_ptr())
    }

    fn last_error() -> serde_json::Value {
        let msg = read_ffi_string(reprise_last_error());
        serde_json::from_str(&msg).unwrap_or(serde_json::Value::String(msg))
    }

    // -------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------

    #[test]
    fn ffi_version() {
        assert_eq!(reprise_version(), 1);
    }

    #[test]
    fn ffi_open_close_lifecycle() {
        let (_dir, handle, _guard) = ffi_engine("ffi-lifecycle");
        reprise_close(handle);
    }

    #[test]
    fn ffi_null_handle_returns_error() {
        let ptr = call(ptr::null_mut(), "init", "{}");
        assert!(ptr.is_null());
        assert_eq!(last_error(), "null engine handle");

        let ret = reprise_listen(ptr::null_mut(), c("1").as_ptr());
        assert_eq!(ret, 0);
    }

    // -------------------------------------------------------------------
    // Method calls
    // -------------------------------------------------------------------

    #[test]
    fn ffi_create_and_dispose() {
        let (dir, handle, _guard) = ffi_engine("ffi-create");
        let file = dir.path().join("missing.mp3");
        let args = serde_json::json!({"uri": file, "clipRange": [0, 1000], "loopingTimes": 1});

        let json = read_ffi_string(call(handle, "create", &args.to_string()));
        let created: serde_json::Value = serde_json::from_str(&json).unwrap();
        let id = created["playerId"].as_str().unwrap().to_string();

        let json = read_ffi_string(call(handle, "setVolume", &format!(r#"{{"playerId":"{}","volume":0.5}}"#, id)));
        assert_eq!(json, "null");

        let json = read_ffi_string(call(handle, "dispose", &format!(r#"{{"playerId":"{}"}}"#, id)));
        assert_eq!(json, "null");

        reprise_close(handle);
    }

    #[test]
    fn ffi_errors_are_json_payloads() {
        let (_dir, handle, _guard) = ffi_engine("ffi-errors");

        assert!(call(handle, "play", r#"{"playerId":"nope"}"#).is_null());
        let err = last_error();
        assert_eq!(err["code"], "Unknown playerId");
        assert_eq!(err["message"], "No audio player associated with player id nope");

        assert!(call(handle, "rewind", "{}").is_null());
        assert_eq!(last_error()["code"], "NotImplemented");

        assert!(call(handle, "create", "not json").is_null());
        assert!(last_error().is_string());

        reprise_close(handle);
    }

    #[test]
    fn ffi_null_args_are_allowed() {
        let (_dir, handle, _guard) = ffi_engine("ffi-null-args");
        let method = c("clearCache");
        let json = read_ffi_string(reprise_method_call(handle, method.as_ptr(), ptr::null()));
        assert_eq!(json, "null");
        reprise_close(handle);
    }

    // -------------------------------------------------------------------
    // Event channels
    // -------------------------------------------------------------------

    #[test]
    fn ffi_listen_and_poll_events() {
        let (dir, handle, _guard) = ffi_engine("ffi-events");
        let file = dir.path().join("missing.mp3");
        let args = serde_json::json!({"uri": file});
        let json = read_ffi_string(call(handle, "create", &args.to_string()));
        let id: serde_json::Value = serde_json::from_str(&json).unwrap();
        let id = c(id["playerId"].as_str().unwrap());

        assert!(reprise_poll_events(handle, id.as_ptr()).is_null());
        assert_eq!(reprise_listen(handle, id.as_ptr()), 1);

        // Download state is queued at create; the missing file fails decoding.
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut messages = Vec::new();
        while Instant::now() < deadline {
            let json = read_ffi_string(reprise_poll_events(handle, id.as_ptr()));
            let batch: Vec<serde_json::Value> = serde_json::from_str(&json).unwrap();
            messages.extend(batch);
            if messages.iter().any(|m| m["kind"] == "error") {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(messages.iter().any(|m| m["event"]["event"] == "downloadState"));
        let error = messages.iter().find(|m| m["kind"] == "error").unwrap();
        assert_eq!(error["code"], "AudioError");

        assert_eq!(reprise_cancel(handle, id.as_ptr()), 1);
        assert!(reprise_poll_events(handle, id.as_ptr()).is_null());

        reprise_close(handle);
    }

    // -------------------------------------------------------------------
    // Downloads, settings & raw scrolls
    // -------------------------------------------------------------------

    #[test]
    fn ffi_downloads_empty_and_pausable() {
        let (_dir, handle, _guard) = ffi_engine("ffi-downloads");
        let json = read_ffi_string(reprise_downloads(handle));
        assert_eq!(json, "[]");
        assert_eq!(reprise_set_downloads_paused(handle, 1), 1);
        assert_eq!(reprise_set_downloads_paused(handle, 0), 1);
        reprise_close(handle);
    }

    #[test]
    fn ffi_configure_applies_on_reopen() {
        let (dir, handle, _guard) = ffi_engine("ffi-configure");
        let cache = dir.path().join("custom-cache");
        let settings = c(&serde_json::json!({"cache_dir": cache}).to_string());
        assert_eq!(reprise_configure(handle, settings.as_ptr()), 1);

        let path = c(reprise_core::paths::SETTINGS_ENGINE);
        let json = read_ffi_string(reprise_read(handle, path.as_ptr()));
        let scroll: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(scroll["data"]["cache_dir"], cache.to_str().unwrap());
        reprise_close(handle);

        let app = c("ffi-configure");
        let handle = unsafe { reprise_open(app.as_ptr()) };
        assert!(!handle.is_null());
        assert!(cache.is_dir());

        let bad = c("{");
        assert_eq!(reprise_configure(handle, bad.as_ptr()), 0);
        reprise_close(handle);
    }

    #[test]
    fn ffi_list_mirrored_player_events() {
        let (dir, handle, _guard) = ffi_engine("ffi-list");
        let args = serde_json::json!({"uri": dir.path().join("a.mp3")});
        let _ = read_ffi_string(call(handle, "create", &args.to_string()));

        let prefix = c(reprise_core::paths::PLAYERS_PREFIX);
        let json = read_ffi_string(reprise_list(handle, prefix.as_ptr()));
        let paths: Vec<String> = serde_json::from_str(&json).unwrap();
        assert!(paths.contains(&"/reprise/players/1/event".to_string()));

        let missing = c("/reprise/nothing/here");
        assert!(reprise_read(handle, missing.as_ptr()).is_null());
        reprise_close(handle);
    }

    // -------------------------------------------------------------------
    // String free safety
    // -------------------------------------------------------------------

    #[test]
    fn ffi_string_free_null_safe() {
        unsafe { reprise_string_free(ptr::null_mut()) };
    }
}
