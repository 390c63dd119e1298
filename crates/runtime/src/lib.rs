pub mod clock;
pub mod context;
pub mod driver;
pub mod jobs;
pub mod mood;
pub mod state;

pub use clock::AdaptiveClock;
pub use context::{GenerationSettings, JobContext, integrity_auditor, open_clock};
pub use driver::{Pulse, STATUS_FILE, Scheduler};
pub use jobs::{ChainJob, IntegrityJob, Job, JobKind, JobOutcome, ThoughtJob, default_jobs};
pub use mood::{AFFECT_FILE, MoodState, MoodStore};
pub use state::{ChainRecord, MoodTransition, STATE_FILE, SchedulerState, SchedulerStateStore};
