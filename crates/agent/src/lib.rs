//! # Parley Agent
//!
//! The conversational pipeline: an ordered chain of advisors around a
//! tool-calling model loop.
//!
//! ```text
//! ChatPipeline::ask(question, AuthContext)
//!   └─ ChatMemoryAdvisor   lock turn, read window, … write [user, assistant]
//!       └─ RetrievalAdvisor   add matching documents as context
//!           └─ ModelCall         provider ⇄ tools until a final answer
//! ```

pub mod advisor;
pub mod error;
pub mod memory_advisor;
pub mod model_call;
pub mod pipeline;
pub mod retrieval_advisor;

#[cfg(test)]
mod test_support;

pub use advisor::{Advisor, Next, PipelineRequest, PipelineResponse, ToolInvocation, TurnContext};
pub use error::PipelineError;
pub use memory_advisor::ChatMemoryAdvisor;
pub use model_call::{DEFAULT_MAX_ITERATIONS, ModelCall, ToolSource};
pub use pipeline::{ChatPipeline, ChatPipelineBuilder};
pub use retrieval_advisor::{DEFAULT_TOP_K, RetrievalAdvisor};
