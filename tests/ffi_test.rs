//! C ABI tests: lifecycle, error reporting and null handling.

mod common;

use std::ffi::{c_char, CStr, CString};
use std::ptr;

use pocket_llm::ffi::{
    pocket_llm_cancel, pocket_llm_clear_last_error, pocket_llm_device_info,
    pocket_llm_engine_create, pocket_llm_engine_destroy, pocket_llm_generate_text,
    pocket_llm_last_error, pocket_llm_load_model, pocket_llm_state, pocket_llm_string_free,
    pocket_llm_unload_model, PocketStatus,
};
use pocket_llm::models::SynthConfig;

/// Take ownership of a returned string.
unsafe fn take(s: *mut c_char) -> String {
    assert!(!s.is_null());
    let out = CStr::from_ptr(s).to_str().unwrap().to_string();
    pocket_llm_string_free(s);
    out
}

unsafe fn last_error() -> Option<String> {
    let p = pocket_llm_last_error();
    if p.is_null() {
        None
    } else {
        Some(CStr::from_ptr(p).to_string_lossy().into_owned())
    }
}

#[test]
fn test_full_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let model = common::write_model(dir.path(), "tiny.gguf", &SynthConfig::default());
    let model = CString::new(model.to_str().unwrap()).unwrap();
    let cache = CString::new(dir.path().join("k").to_str().unwrap()).unwrap();
    let prompt = CString::new("hello").unwrap();

    unsafe {
        let engine = pocket_llm_engine_create(ptr::null());
        assert!(!engine.is_null());
        assert_eq!(pocket_llm_state(engine), 0);

        let info = take(pocket_llm_device_info(engine));
        assert!(info.contains("Engine state: unloaded"));

        assert!(pocket_llm_load_model(engine, model.as_ptr(), cache.as_ptr()));
        assert_eq!(pocket_llm_state(engine), 2);

        let text = take(pocket_llm_generate_text(engine, prompt.as_ptr(), 3));
        assert!(text.starts_with("hello"), "{}", text);

        // Negative counts behave like zero.
        let text = take(pocket_llm_generate_text(engine, prompt.as_ptr(), -5));
        assert_eq!(text, "hello");

        assert_eq!(pocket_llm_unload_model(engine), PocketStatus::Ok as i32);
        assert_eq!(pocket_llm_unload_model(engine), PocketStatus::Ok as i32);
        assert_eq!(pocket_llm_state(engine), 0);

        pocket_llm_cancel(engine);
        pocket_llm_engine_destroy(engine);
    }
}

#[test]
fn test_generate_before_load_reports_error_string() {
    let prompt = CString::new("hi").unwrap();
    unsafe {
        pocket_llm_clear_last_error();
        let engine = pocket_llm_engine_create(ptr::null());
        let text = take(pocket_llm_generate_text(engine, prompt.as_ptr(), 4));
        assert!(text.starts_with("[error] NotReadyError"), "{}", text);
        assert!(last_error().is_some());
        pocket_llm_engine_destroy(engine);
    }
}

#[test]
fn test_failed_load_sets_last_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = CString::new(dir.path().join("nope.gguf").to_str().unwrap()).unwrap();
    let cache = CString::new(dir.path().to_str().unwrap()).unwrap();
    unsafe {
        pocket_llm_clear_last_error();
        let engine = pocket_llm_engine_create(ptr::null());
        assert!(!pocket_llm_load_model(engine, missing.as_ptr(), cache.as_ptr()));
        let msg = last_error().unwrap();
        assert!(msg.starts_with("IoError"), "{}", msg);
        assert_eq!(pocket_llm_state(engine), 4);
        pocket_llm_engine_destroy(engine);
    }
}

#[test]
fn test_null_arguments_are_rejected() {
    unsafe {
        pocket_llm_clear_last_error();
        assert!(!pocket_llm_load_model(ptr::null(), ptr::null(), ptr::null()));
        assert!(last_error().unwrap().contains("engine"));

        let engine = pocket_llm_engine_create(ptr::null());
        let cache = CString::new("/tmp").unwrap();
        assert!(!pocket_llm_load_model(engine, ptr::null(), cache.as_ptr()));
        assert!(last_error().unwrap().contains("model_path"));
        assert!(pocket_llm_generate_text(engine, ptr::null(), 1).is_null());

        assert_eq!(pocket_llm_unload_model(ptr::null()), PocketStatus::NullPointer as i32);
        assert_eq!(pocket_llm_state(ptr::null()), PocketStatus::NullPointer as i32);
        pocket_llm_cancel(ptr::null());
        pocket_llm_string_free(ptr::null_mut());
        pocket_llm_engine_destroy(ptr::null_mut());
        pocket_llm_engine_destroy(engine);
    }
}

#[test]
fn test_device_info_without_engine() {
    unsafe {
        let info = take(pocket_llm_device_info(ptr::null()));
        assert!(info.contains("Accelerator:"));
        assert!(!info.contains("Engine state"));
    }
}

#[test]
fn test_invalid_config_path_returns_null() {
    let path = CString::new("/nonexistent/pocket.toml").unwrap();
    unsafe {
        pocket_llm_clear_last_error();
        let engine = pocket_llm_engine_create(path.as_ptr());
        assert!(engine.is_null());
        assert!(last_error().unwrap().starts_with("config:"));
    }
}

#[test]
fn test_invalid_utf8_is_rejected() {
    let bad = [0xffu8, 0xfe, 0x00];
    unsafe {
        let engine = pocket_llm_engine_create(ptr::null());
        let out = pocket_llm_generate_text(engine, bad.as_ptr() as *const c_char, 1);
        assert!(out.is_null());
        assert!(last_error().unwrap().contains("UTF-8"));
        pocket_llm_engine_destroy(engine);
    }
}
