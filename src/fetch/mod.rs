//! Remote access: concurrency gates, HTTP source and page parsing

mod gate;
mod parser;
mod source;

pub use gate::{FetchGate, FetchPermit, GateError, SessionGate, default_global_limit};
pub use parser::{HtmlImageParser, PageParser};
pub use source::{
    BoxFuture, DEFAULT_TIMEOUT_SECS, DEFAULT_USER_AGENT, FetchError, PageSource, ReqwestSource,
};
