// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! Architecture specific support code.

pub mod riscv;
