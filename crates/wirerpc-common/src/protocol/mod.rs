pub mod context;
pub mod error;
pub mod requests;
pub mod responses;
pub mod status;


pub use context::{CallContext, FilterDecision};
pub use error::{CallError, CallOutcome, RemoteError, Result, WireRpcError};
pub use requests::{Request, RequestId, ServiceId, Tracer};
pub use responses::Response;
pub use status::StatusCode;
