// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The completion-provider boundary.
//!
//! Agents drive a model through [`CompletionProvider`]: a streaming
//! request/response contract over typed messages.  The concrete provider
//! SDK lives outside this workspace; tests use [`MockProvider`] and
//! [`ScriptedProvider`].

pub mod mock;
pub mod provider;
pub mod types;

pub use mock::{FailingProvider, MockProvider, ScriptedProvider};
pub use provider::{CompletionProvider, ResponseStream};
pub use types::{
    CompletionRequest, ContentBlock, Message, MessageContent, ResponseEvent, Role,
    ToolResultBlock, ToolSchema, ToolUseBlock,
};
