pub mod headers;
pub mod http;
