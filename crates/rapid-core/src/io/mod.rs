//! IO modules - side effects (network)

pub mod http;
