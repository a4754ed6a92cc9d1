pub mod frame;
pub mod query;
pub mod record;
pub mod roi;

pub use frame::{Frame, FrameStatus};
pub use query::{CandidatePath, ConfidenceLabel, QueryResponse, QueryRun, QueryState};
pub use record::{CanonicalRecord, Provenance, RecordBody, RecordKind};
pub use roi::{CandidateRoi, ParsedElement, RoiClass, RoiParseResult};
