/*!
# Liftwatch DevKit - stubs and helpers for exercising the poll loop

Makes it possible to drive the watcher without network access:
- Scripted status source replaying snapshots and failures
- Recording / failing notification sinks
- Test harness wiring them into a real `PollLoop`
*/

pub mod sink_stub;
pub mod status_stub;
pub mod test_utils;

pub use sink_stub::{MockSink, SentNotification};
pub use status_stub::{snapshot, ScriptedStatusSource};
pub use test_utils::TestHarness;
