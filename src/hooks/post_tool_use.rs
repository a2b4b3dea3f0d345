//! PostToolUse hook implementation
//!
//! Counts completed tool calls for the per-turn activity summary.

use std::sync::Arc;

use claude_code_agent_sdk::{
    HookCallback, HookContext, HookInput, HookJsonOutput, SyncHookJsonOutput,
};
use futures::future::BoxFuture;
use tracing::Instrument;

use crate::session::TurnCounters;

fn continue_output() -> HookJsonOutput {
    HookJsonOutput::Sync(SyncHookJsonOutput {
        continue_: Some(true),
        ..Default::default()
    })
}

/// Creates a PostToolUse hook that records each completed tool call.
///
/// Counts land in `counters` and are drained when the turn's result is
/// emitted.
pub fn create_post_tool_use_hook(counters: Arc<TurnCounters>) -> HookCallback {
    Arc::new(
        move |input: HookInput, tool_use_id: Option<String>, _context: HookContext| {
            let counters = Arc::clone(&counters);

            let HookInput::PostToolUse(post_tool) = input else {
                let span = tracing::debug_span!(
                    "post_tool_use_hook_skip",
                    event_type = ?std::mem::discriminant(&input)
                );
                return Box::pin(
                    async move {
                        tracing::debug!("Ignoring non-PostToolUse event");
                        continue_output()
                    }
                    .instrument(span),
                ) as BoxFuture<'static, HookJsonOutput>;
            };

            let span = tracing::info_span!(
                "post_tool_use_hook",
                tool_name = %post_tool.tool_name,
                tool_use_id = ?tool_use_id,
            );

            Box::pin(
                async move {
                    counters.record_tool(&post_tool.tool_name);
                    let activity = counters.get();
                    tracing::debug!(
                        tool_calls = activity.tool_calls,
                        file_edits = activity.file_edits,
                        "PostToolUse recorded"
                    );
                    continue_output()
                }
                .instrument(span),
            ) as BoxFuture<'static, HookJsonOutput>
        },
    )
}
