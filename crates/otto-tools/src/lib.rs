// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod descriptor;
pub mod registry;
pub mod visibility;

pub use descriptor::{
    validate_args, ContainerDescriptor, ContainerText, ThreadMode, ToolCall, ToolDescriptor,
    ToolHandler, ToolOutput, ToolSource,
};
pub use registry::{ToolSet, ToolSetBuilder, ToolSetError};
pub use visibility::{
    merge_protocol_block, protocol_block, strip_protocol_block, VisibleTool,
    CONTAINER_PROTOCOL_HEADER,
};
