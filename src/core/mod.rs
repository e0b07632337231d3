pub mod clock;
pub mod context;
pub mod destination;
pub mod error;
pub mod load_balancer;
pub mod pipeline;
pub mod rate_limiter;
pub mod route_table;
pub mod summary;
pub mod trace;

pub use context::{Outcome, RequestContext};
pub use error::EdgeError;
pub use load_balancer::LoadBalancerFactory;
pub use pipeline::{EdgePipeline, EdgePipelineBuilder, PipelineDeps, Stage};
pub use rate_limiter::{Admission, RateLimiter};
pub use route_table::{RouteEntry, RouteTable};
pub use summary::{SummaryRecord, SummaryRecorder};
pub use trace::{ActiveSpan, FinishedSpan, TraceContextManager};
