// Copyright 2024-2026 pocket-llm Contributors
// SPDX-License-Identifier: Apache-2.0

//! Thread-local last-error channel.

use std::cell::RefCell;
use std::ffi::{c_char, CString};

use crate::engine::{EngineError, ErrorKind};

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Status codes returned across the C boundary. Engine failures use the
/// [`ErrorKind::code`] values; the ones below are specific to the ABI.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PocketStatus {
    Ok = 0,
    NullPointer = -20,
    InvalidUtf8 = -21,
    Panic = -22,
}

pub(crate) fn set_last_error(msg: impl Into<String>) {
    let msg = msg.into().replace('\0', " ");
    let c = CString::new(msg).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(c));
}

pub(crate) fn set_engine_error(err: &EngineError) -> i32 {
    let kind: ErrorKind = err.kind();
    set_last_error(format!("{}: {}", kind.name(), err));
    kind.code()
}

/// Last error message on this thread, or null. The pointer stays valid
/// until the next failing call on the same thread; do not free it.
#[no_mangle]
pub extern "C" fn pocket_llm_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| match slot.borrow().as_ref() {
        Some(c) => c.as_ptr(),
        None => std::ptr::null(),
    })
}

#[no_mangle]
pub extern "C" fn pocket_llm_clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn last_error_is_thread_local() {
        pocket_llm_clear_last_error();
        set_last_error("boom\0tail");
        let msg = unsafe { CStr::from_ptr(pocket_llm_last_error()) };
        assert_eq!(msg.to_str().unwrap(), "boom tail");

        std::thread::spawn(|| assert!(pocket_llm_last_error().is_null()))
            .join()
            .unwrap();

        pocket_llm_clear_last_error();
        assert!(pocket_llm_last_error().is_null());
    }

    #[test]
    fn engine_errors_map_to_kind_codes() {
        let code = set_engine_error(&EngineError::AlreadyLoaded);
        assert_eq!(code, ErrorKind::AlreadyLoaded.code());
        let msg = unsafe { CStr::from_ptr(pocket_llm_last_error()) };
        assert!(msg.to_str().unwrap().starts_with("AlreadyLoadedError"));
    }
}
