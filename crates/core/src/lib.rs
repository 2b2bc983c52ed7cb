//! # Parley Core
//!
//! Domain types, traits, and error definitions for the Parley
//! conversational pipeline. This crate has no framework dependencies; it
//! defines the model every other crate implements against.
//!
//! ## Layout
//!
//! Every subsystem is a trait here with implementations in its own crate:
//! - [`Provider`]: language model backends (`parley-providers`)
//! - [`ChatMemory`] / [`ChatMemoryRepository`]: conversation history (`parley-memory`)
//! - [`RetrievalIndex`]: similarity search (`parley-memory`)
//! - [`TokenExchanger`]: audience-scoped credentials (`parley-security`)
//! - [`Tool`] / [`RemoteInvoker`]: tool execution (`parley-tools`)

pub mod error;
pub mod message;
pub mod provider;
pub mod auth;
pub mod tool;
pub mod memory;
pub mod retrieval;
pub mod event;

// Re-export key types at crate root for ergonomics
pub use error::{AuthError, Error, MemoryError, ProviderError, Result, RetrievalError, ToolError};
pub use message::{ConversationId, Message, MessageToolCall, Role};
pub use provider::{
    EmbeddingRequest, EmbeddingResponse, Provider, ProviderRequest, ProviderResponse,
    ToolDefinition, Usage,
};
pub use auth::{AccessToken, AuthContext, Credential, Principal, TokenExchanger};
pub use tool::{
    AuthRequirement, RemoteInvoker, Tool, ToolCallRequest, ToolCallResult, ToolContext,
    ToolDescriptor, ToolOutput, ToolRegistry, ToolRegistryBuilder, ToolTarget,
};
pub use memory::{ChatMemory, ChatMemoryRepository, ConversationLocks, MemoryWindow, TurnGuard};
pub use retrieval::{Document, Embedder, ProviderEmbedder, RetrievalIndex};
pub use event::{DomainEvent, EventBus};
