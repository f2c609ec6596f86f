//! [`ClientWrapper`](crate::client_wrapper::ClientWrapper) implementations used by the
//! LLM-backed reviewer.

pub mod http_pool;
pub mod openai;
