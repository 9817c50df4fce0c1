// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod client;
mod mock;
mod types;

pub use client::{ChatClient, ResponseStream};
pub use mock::{collect_response, MockClient, RecordedRequest, ScriptedMockClient};
pub use types::*;
