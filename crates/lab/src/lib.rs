//! Lab harness and state isolation for scripted, reproducible testing of
//! the agent stack against recorded or live LLM traffic (§4.9).

pub mod agent_loop;
pub mod harness;
pub mod mock_channel;
pub mod state;

pub use agent_loop::AgentLoopStub;
pub use harness::{LabConfig, LabError, LabHarness, ScriptMessage, ScriptResult};
pub use mock_channel::{InboundMessage, MockChannel, OutboundMessage};
pub use state::{DataPaths, LabStateError, SnapshotManifest, SnapshotSource};
