//! Calls between partitions
//!
//! This module provides:
//! - [`MatchingClient`] trait used by the forwarder to reach a parent partition
//! - Request/response types for forwarded tasks, polls and queries
//! - [`InMemoryMatchingClient`] wiring matchers of one process together

mod client;
mod memory;

pub use client::{
    AddTaskRequest, MatchingClient, PollRequest, PollResponse, QueryCompletion,
    QueryWorkflowRequest, RespondQueryTaskCompletedRequest, TaskQueueRef, TransportError,
};
pub use memory::InMemoryMatchingClient;
