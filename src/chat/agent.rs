//! Tool-augmented agent: a reason-and-act loop over a set of tools.
//!
//! Each step asks the model for a `Thought`, then either an `Action` with an
//! `Action Input` or a `Final Answer`.  Actions are run and their output is
//! appended to the scratchpad as an `Observation` for the next step.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client as ReqwestClient;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chat::brain::{ChatModel, HistoryEntry};
use crate::error::{Error, Result};
use crate::observability::{AGENT_PARSE_ERRORS, AGENT_STEPS, AGENT_TOOL_CALLS};
use crate::types::{Role, to_backend_messages};

/// Steps taken before the agent gives up.
pub const MAX_ITERATIONS: usize = 15;

/// Answer returned when the step limit is reached.
pub const STOPPED_ANSWER: &str = "Agent stopped due to iteration limit or time limit.";

/// Observation fed back when a step could not be parsed.
const INVALID_FORMAT_OBSERVATION: &str = "Invalid or incomplete response";

const FINAL_ANSWER: &str = "Final Answer:";
const ACTION: &str = "Action:";
const ACTION_INPUT: &str = "Action Input:";
const OBSERVATION: &str = "Observation:";

/////////////////////////////////////////////// Tool ///////////////////////////////////////////////

/// A capability the agent can invoke by name.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Returns the name the model uses to call the tool.
    fn name(&self) -> &str;

    /// Returns a one-paragraph description shown to the model.
    fn description(&self) -> &str;

    /// Runs the tool on the model-provided input.
    async fn call(&self, input: &str) -> Result<String>;
}

//////////////////////////////////////////// TavilySearch ////////////////////////////////////////////

/// Environment variable holding the search-provider credential.
pub const SEARCH_KEY_ENV_VAR: &str = "TAVILY_API_KEY";

const TAVILY_URL: &str = "https://api.tavily.com/search";
const TAVILY_MAX_RESULTS: usize = 5;
const TAVILY_TIMEOUT: Duration = Duration::from_secs(30);

/// Web search through the Tavily API.
pub struct TavilySearch {
    api_key: String,
    client: ReqwestClient,
    url: String,
}

impl TavilySearch {
    /// Creates a search tool with the given credential.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = ReqwestClient::builder()
            .timeout(TAVILY_TIMEOUT)
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {}", e),
                    Some(Box::new(e)),
                )
            })?;
        Ok(Self {
            api_key: api_key.into(),
            client,
            url: TAVILY_URL.to_string(),
        })
    }

    /// Creates a search tool when `TAVILY_API_KEY` is set and non-empty.
    pub fn from_env() -> Option<Self> {
        let key = env::var(SEARCH_KEY_ENV_VAR).ok()?;
        if key.trim().is_empty() {
            return None;
        }
        match Self::new(key) {
            Ok(tool) => Some(tool),
            Err(err) => {
                debug!(error = %err, "web search unavailable");
                None
            }
        }
    }
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Deserialize)]
struct SearchResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

#[async_trait::async_trait]
impl Tool for TavilySearch {
    fn name(&self) -> &str {
        "tavily_search_results_json"
    }

    fn description(&self) -> &str {
        "A search engine optimized for comprehensive, accurate, and trusted results. \
         Useful for when you need to answer questions about current events. \
         Input should be a search query."
    }

    async fn call(&self, input: &str) -> Result<String> {
        let request = SearchRequest {
            api_key: &self.api_key,
            query: input,
            max_results: TAVILY_MAX_RESULTS,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(
                        format!("search timed out: {}", e),
                        Some(TAVILY_TIMEOUT.as_secs_f64()),
                    )
                } else if e.is_connect() {
                    Error::connection("could not reach the search provider", Some(Box::new(e)))
                } else {
                    Error::http_client(format!("search failed: {}", e), Some(Box::new(e)))
                }
            })?;
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(Error::protocol("search provider returned an error", Some(status)));
        }
        let body: SearchResponse = response.json().await.map_err(|e| {
            Error::serialization(
                format!("Failed to parse search results: {}", e),
                Some(Box::new(e)),
            )
        })?;
        Ok(format_results(&body.results))
    }
}

fn format_results(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return "No results found.".to_string();
    }
    results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}. {} ({})\n{}", i + 1, r.title, r.url, r.content.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

///////////////////////////////////////////// AgentStep /////////////////////////////////////////////

/// One parsed model step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentStep {
    /// Run `tool` on `input`.
    Action {
        /// Tool name as written by the model.
        tool: String,
        /// Tool input with surrounding quotes removed.
        input: String,
    },
    /// Stop and answer.
    Finish(String),
}

/// Parses one step of model output.
///
/// ```
/// # use localchat::chat::{AgentStep, parse_step};
/// let step = parse_step("I should look.\nAction: search\nAction Input: \"rust\"").unwrap();
/// assert_eq!(
///     step,
///     AgentStep::Action { tool: "search".to_string(), input: "rust".to_string() }
/// );
/// ```
pub fn parse_step(output: &str) -> Result<AgentStep> {
    let output = truncate_at_observation(output);
    let action = output.find(ACTION);
    let answer = output.find(FINAL_ANSWER);

    match (action, answer) {
        (Some(_), Some(_)) => Err(Error::validation(
            "output contains both a final answer and an action",
            None,
        )),
        (None, Some(at)) => Ok(AgentStep::Finish(
            output[at + FINAL_ANSWER.len()..].trim().to_string(),
        )),
        (Some(at), None) => {
            let rest = &output[at + ACTION.len()..];
            let Some(input_at) = rest.find(ACTION_INPUT) else {
                return Err(Error::validation(
                    "Missing 'Action Input:' after 'Action:'",
                    None,
                ));
            };
            let tool = rest[..input_at].trim().to_string();
            let input = rest[input_at + ACTION_INPUT.len()..]
                .trim()
                .trim_matches('"')
                .to_string();
            if tool.is_empty() {
                return Err(Error::validation("Missing tool name after 'Action:'", None));
            }
            Ok(AgentStep::Action { tool, input })
        }
        (None, None) => Err(Error::validation(
            "Missing 'Action:' after 'Thought:'",
            None,
        )),
    }
}

fn truncate_at_observation(output: &str) -> &str {
    match output.find(OBSERVATION) {
        Some(at) => &output[..at],
        None => output,
    }
}

/////////////////////////////////////////// AgentPipeline ///////////////////////////////////////////

/// Reason-and-act execution over a non-empty tool set.
pub struct AgentPipeline {
    model: ChatModel,
    tools: Vec<Arc<dyn Tool>>,
    max_iterations: usize,
}

impl AgentPipeline {
    /// Creates an agent over `tools`.
    pub fn new(model: ChatModel, tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            model,
            tools,
            max_iterations: MAX_ITERATIONS,
        }
    }

    /// Overrides the step limit.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Names of the available tools.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    fn instructions(&self) -> String {
        let descriptions = self
            .tools
            .iter()
            .map(|t| format!("{}: {}", t.name(), t.description()))
            .collect::<Vec<_>>()
            .join("\n");
        let names = self.tool_names().join(", ");
        format!(
            "Answer the following questions as best you can. You have access to the following tools:\n\n\
             {descriptions}\n\n\
             Use the following format:\n\n\
             Question: the input question you must answer\n\
             Thought: you should always think about what to do\n\
             Action: the action to take, should be one of [{names}]\n\
             Action Input: the input to the action\n\
             Observation: the result of the action\n\
             ... (this Thought/Action/Action Input/Observation can repeat N times)\n\
             Thought: I now know the final answer\n\
             Final Answer: the final answer to the original input question\n\n\
             Begin!"
        )
    }

    /// Runs the loop for `input` and returns the final answer.
    pub async fn generate(&self, history: &[HistoryEntry], input: &str) -> Result<String> {
        let instructions = self.instructions();
        let mut scratchpad = String::new();

        for step in 0..self.max_iterations {
            AGENT_STEPS.click();
            let question = format!("Question: {input}\nThought:{scratchpad}");
            let messages = to_backend_messages(
                history
                    .iter()
                    .map(|h| (h.role, h.content.as_str()))
                    .chain(std::iter::once((Role::User, question.as_str()))),
                Some(&instructions),
            );
            let output = self
                .model
                .invoke_with_stop(messages, vec![format!("\n{OBSERVATION}")])
                .await?;
            let output = truncate_at_observation(&output).trim_end().to_string();

            let observation = match parse_step(&output) {
                Ok(AgentStep::Finish(answer)) => {
                    debug!(step, "agent finished");
                    return Ok(answer);
                }
                Ok(AgentStep::Action { tool, input }) => self.run_tool(&tool, &input).await,
                Err(err) => {
                    AGENT_PARSE_ERRORS.click();
                    debug!(step, error = %err, "unparseable agent step");
                    INVALID_FORMAT_OBSERVATION.to_string()
                }
            };
            scratchpad.push_str(&format!(" {output}\n{OBSERVATION} {observation}\nThought:"));
        }
        Ok(STOPPED_ANSWER.to_string())
    }

    async fn run_tool(&self, name: &str, input: &str) -> String {
        let Some(tool) = self.tools.iter().find(|t| t.name() == name) else {
            return format!(
                "{name} is not a valid tool, try one of [{}].",
                self.tool_names().join(", ")
            );
        };
        AGENT_TOOL_CALLS.click();
        debug!(tool = name, "calling tool");
        match tool.call(input).await {
            Ok(output) => output,
            Err(err) => format!("Tool error: {err}"),
        }
    }
}
