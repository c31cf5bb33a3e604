use biometrics::{Collector, Counter, Moments};

pub(crate) static CLIENT_REQUESTS: Counter = Counter::new("localchat.client.requests");
pub(crate) static CLIENT_REQUEST_ERRORS: Counter = Counter::new("localchat.client.request_errors");
pub(crate) static CLIENT_REQUEST_DURATION: Moments =
    Moments::new("localchat.client.request_duration_seconds");

pub(crate) static STREAM_TOKENS: Counter = Counter::new("localchat.stream.tokens");
pub(crate) static STREAM_SKIPPED_LINES: Counter = Counter::new("localchat.stream.skipped_lines");
pub(crate) static STREAM_TTFT: Moments = Moments::new("localchat.stream.ttft_seconds");

pub(crate) static BRAIN_TURNS: Counter = Counter::new("localchat.brain.turns");
pub(crate) static BRAIN_TURN_ERRORS: Counter = Counter::new("localchat.brain.turn_errors");
pub(crate) static BRAIN_REBUILDS: Counter = Counter::new("localchat.brain.rebuilds");

pub(crate) static AGENT_STEPS: Counter = Counter::new("localchat.agent.steps");
pub(crate) static AGENT_TOOL_CALLS: Counter = Counter::new("localchat.agent.tool_calls");
pub(crate) static AGENT_PARSE_ERRORS: Counter = Counter::new("localchat.agent.parse_errors");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&CLIENT_REQUESTS);
    collector.register_counter(&CLIENT_REQUEST_ERRORS);
    collector.register_moments(&CLIENT_REQUEST_DURATION);

    collector.register_counter(&STREAM_TOKENS);
    collector.register_counter(&STREAM_SKIPPED_LINES);
    collector.register_moments(&STREAM_TTFT);

    collector.register_counter(&BRAIN_TURNS);
    collector.register_counter(&BRAIN_TURN_ERRORS);
    collector.register_counter(&BRAIN_REBUILDS);

    collector.register_counter(&AGENT_STEPS);
    collector.register_counter(&AGENT_TOOL_CALLS);
    collector.register_counter(&AGENT_PARSE_ERRORS);
}
