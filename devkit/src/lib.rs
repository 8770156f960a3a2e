/*!
# cfopt DevKit - mocks and harness for kernel tests

- In-memory remote store and connector standing in for SSH devices
- Fake speed-test tool (shell script writing a chosen CSV, Unix only)
- Guard and probe doubles for contention and heartbeat scenarios
- `TestHarness` wiring a real `Optimizer` to all of the above
*/

pub mod fake_tool;
pub mod mock_remote;
pub mod test_utils;

pub use fake_tool::FakeSpeedTest;
pub use mock_remote::{MockConnector, MockRemoteStore};
pub use test_utils::{init_test_logging, ContendedGuard, ScriptedProbe, TestHarness};
