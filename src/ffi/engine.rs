// Copyright 2024-2026 pocket-llm Contributors
// SPDX-License-Identifier: Apache-2.0

//! Engine lifecycle functions.

use std::ffi::{c_char, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

use super::error::{set_engine_error, set_last_error, PocketStatus};
use crate::config;
use crate::engine::{DeviceProfiler, Engine, ERROR_PREFIX};

/// Opaque engine handle.
pub struct PocketEngine {
    inner: Engine,
}

/// Borrow a C string argument as UTF-8, recording the failure otherwise.
unsafe fn arg_str<'a>(ptr: *const c_char, name: &str) -> Result<&'a str, PocketStatus> {
    if ptr.is_null() {
        set_last_error(format!("null pointer argument: {}", name));
        return Err(PocketStatus::NullPointer);
    }
    CStr::from_ptr(ptr).to_str().map_err(|_| {
        set_last_error(format!("invalid UTF-8 in {}", name));
        PocketStatus::InvalidUtf8
    })
}

unsafe fn engine_ref<'a>(engine: *const PocketEngine) -> Option<&'a Engine> {
    if engine.is_null() {
        set_last_error("null pointer argument: engine");
        None
    } else {
        Some(&(*engine).inner)
    }
}

fn into_c_string(s: String) -> *mut c_char {
    let s = if s.contains('\0') { s.replace('\0', " ") } else { s };
    match CString::new(s) {
        Ok(c) => c.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

fn guarded<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => v,
        Err(_) => {
            set_last_error("internal panic");
            fallback
        }
    }
}

/// Create an engine. `config_path` names a TOML file or is null for
/// defaults; `POCKET_LLM_*` environment overrides apply either way.
/// Returns null on failure.
///
/// # Safety
/// `config_path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn pocket_llm_engine_create(config_path: *const c_char) -> *mut PocketEngine {
    guarded(std::ptr::null_mut(), || {
        let path = if config_path.is_null() {
            None
        } else {
            match arg_str(config_path, "config_path") {
                Ok(p) => Some(Path::new(p)),
                Err(_) => return std::ptr::null_mut(),
            }
        };
        match config::load(path) {
            Ok(cfg) => Box::into_raw(Box::new(PocketEngine { inner: Engine::new(cfg) })),
            Err(e) => {
                set_last_error(format!("config: {}", e));
                std::ptr::null_mut()
            }
        }
    })
}

/// Destroy an engine, releasing any loaded model.
///
/// # Safety
/// `engine` must be null or a pointer from [`pocket_llm_engine_create`] not
/// yet destroyed, with no call on it in flight.
#[no_mangle]
pub unsafe extern "C" fn pocket_llm_engine_destroy(engine: *mut PocketEngine) {
    if !engine.is_null() {
        drop(Box::from_raw(engine));
    }
}

/// Load a model, compiling kernels into `cache_dir` on first use.
///
/// # Safety
/// Pointers must be valid; strings NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn pocket_llm_load_model(
    engine: *const PocketEngine,
    model_path: *const c_char,
    cache_dir: *const c_char,
) -> bool {
    guarded(false, || {
        let Some(engine) = engine_ref(engine) else {
            return false;
        };
        let (model_path, cache_dir) = match (
            arg_str(model_path, "model_path"),
            arg_str(cache_dir, "cache_dir"),
        ) {
            (Ok(m), Ok(c)) => (m, c),
            _ => return false,
        };
        match engine.load(Path::new(model_path), Path::new(cache_dir)) {
            Ok(()) => true,
            Err(e) => {
                set_engine_error(&e);
                false
            }
        }
    })
}

/// Generate up to `max_tokens` tokens; negative counts are treated as zero.
/// Returns the prompt followed by the continuation, or a string beginning
/// with `[error] `. Free the result with [`pocket_llm_string_free`]. Null only
/// for invalid arguments.
///
/// # Safety
/// Pointers must be valid; `prompt` NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn pocket_llm_generate_text(
    engine: *const PocketEngine,
    prompt: *const c_char,
    max_tokens: i32,
) -> *mut c_char {
    guarded(std::ptr::null_mut(), || {
        let Some(engine) = engine_ref(engine) else {
            return std::ptr::null_mut();
        };
        let Ok(prompt) = arg_str(prompt, "prompt") else {
            return std::ptr::null_mut();
        };
        let text = engine.generate_text(prompt, max_tokens.max(0) as usize);
        if let Some(msg) = text.strip_prefix(ERROR_PREFIX) {
            set_last_error(msg);
        }
        into_c_string(text)
    })
}

/// Device capability summary. Works with a null engine, before any load.
///
/// # Safety
/// `engine` must be null or a live engine pointer.
#[no_mangle]
pub unsafe extern "C" fn pocket_llm_device_info(engine: *const PocketEngine) -> *mut c_char {
    guarded(std::ptr::null_mut(), || {
        let info = if engine.is_null() {
            DeviceProfiler::capability().summary()
        } else {
            (*engine).inner.get_device_info()
        };
        into_c_string(info)
    })
}

/// Release the loaded model. A no-op when nothing is loaded.
///
/// # Safety
/// `engine` must be null or a live engine pointer.
#[no_mangle]
pub unsafe extern "C" fn pocket_llm_unload_model(engine: *const PocketEngine) -> i32 {
    guarded(PocketStatus::Panic as i32, || {
        let Some(engine) = engine_ref(engine) else {
            return PocketStatus::NullPointer as i32;
        };
        match engine.unload() {
            Ok(()) => PocketStatus::Ok as i32,
            Err(e) => set_engine_error(&e),
        }
    })
}

/// Stop the in-flight generation after its current token.
///
/// # Safety
/// `engine` must be null or a live engine pointer.
#[no_mangle]
pub unsafe extern "C" fn pocket_llm_cancel(engine: *const PocketEngine) {
    if let Some(engine) = engine_ref(engine) {
        engine.cancel();
    }
}

/// Lifecycle state code (0 unloaded, 1 loading, 2 ready, 3 generating,
/// 4 failed), or a negative status for a null engine.
///
/// # Safety
/// `engine` must be null or a live engine pointer.
#[no_mangle]
pub unsafe extern "C" fn pocket_llm_state(engine: *const PocketEngine) -> i32 {
    match engine_ref(engine) {
        Some(engine) => engine.state().code(),
        None => PocketStatus::NullPointer as i32,
    }
}

/// Free a string returned by this library.
///
/// # Safety
/// `s` must be null or a pointer returned by this library, freed once.
#[no_mangle]
pub unsafe extern "C" fn pocket_llm_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}
