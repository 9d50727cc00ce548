// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Concrete `Executor` implementations, one module per step type.
//! `spec.md` §4.6-§4.15.

pub mod ai;
pub mod call;
pub mod condition;
pub mod db;
pub mod http;
pub mod loop_exec;
pub mod mq;
pub mod nested;
pub mod parallel;
pub mod retry;
pub mod script;
pub mod socket;
