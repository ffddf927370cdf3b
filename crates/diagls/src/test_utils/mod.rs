//
// test_utils/mod.rs
//
// Fakes and fixtures shared by unit and integration tests
//

pub mod project_fixture;
pub mod recording_client;
pub mod scripted_runner;

pub use project_fixture::ProjectFixture;
pub use recording_client::{Published, RecordingClient};
pub use scripted_runner::{RecordedCall, ScriptedRunner};
