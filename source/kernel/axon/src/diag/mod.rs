// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel diagnostics.

#[macro_use]
pub mod log;
