//! Process pipeline supervisor behind `cmr-pipe`.

pub mod policy;
pub mod signals;
pub mod spec;
pub mod supervisor;

pub use policy::{judge, Verdict};
pub use signals::CancelToken;
pub use spec::{parse_pipeline, PipelineSpec, ProcSpec};
pub use supervisor::{PipelineOutcome, StageReport, Supervisor};
