// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Utility modules
//!
//! Common utilities for the mriflow CLI.

pub mod colors;
pub mod progress;

pub use colors::*;
pub use progress::*;
