//! Backend-facing half of the chat pipeline
//!
//! - `backend`: which endpoint a send goes to and what it sends
//! - `prompt`: provider-specific message lists
//! - `retrieval`: reference snippets for file-backed chats
//! - `stream`: reading and decoding streamed responses
//! - `annotation`: tool results carried alongside the text

pub mod annotation;
pub mod backend;
pub mod config;
pub mod prompt;
pub mod retrieval;
pub mod stream;
pub mod tokens;

pub use annotation::Annotation;
pub use backend::{Backend, HostedProvider, MessageFormat, RequestPayload};
pub use config::{init_endpoint_config, load_endpoint_config, save_endpoint_config, EndpointConfig};
pub use prompt::{BuiltMessages, MessageBuilder, PromptBuilder, PromptRequest};
pub use retrieval::{HttpRetriever, RetrievalQuery, Retriever};
pub use stream::{DecodedIncrement, Dialect, IncrementStream};
