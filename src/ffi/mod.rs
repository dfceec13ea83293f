// Copyright 2024-2026 pocket-llm Contributors
// SPDX-License-Identifier: Apache-2.0

//! C ABI for mobile hosts.
//!
//! The host owns one opaque [`PocketEngine`] per model and calls the four
//! lifecycle functions from its own worker threads. Strings returned by the
//! library are heap allocated and must be released with
//! [`pocket_llm_string_free`]. Failures leave a message retrievable with
//! [`pocket_llm_last_error`] on the calling thread.

mod engine;
mod error;

pub use engine::{
    pocket_llm_cancel, pocket_llm_device_info, pocket_llm_engine_create, pocket_llm_engine_destroy,
    pocket_llm_generate_text, pocket_llm_load_model, pocket_llm_state, pocket_llm_string_free,
    pocket_llm_unload_model, PocketEngine,
};
pub use error::{pocket_llm_clear_last_error, pocket_llm_last_error, PocketStatus};
