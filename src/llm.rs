//! LLM Client
//!
//! OpenAI-compatible chat completions client (OpenRouter by default) and
//! the model-backed implementations of the pluggable judges:
//! [`SkillProposer`], [`WorkflowComparator`] and [`ThoughtSummarizer`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::skills::induction::SkillProposer;
use crate::skills::replay::ThoughtSummarizer;
use crate::workflows::{parse_preference, parse_yes_no, Preference, WorkflowComparator};

pub const SIMPLIFY_THOUGHT_PROMPT: &str = "You are a helpful assistant in summarizing web browsing actions. Your task is to summarize the main action taken and the corresponding state change, from the input thought process and environmental description.

Example input:
'''Let me think about this step by step:
1) I've clicked the Columns button and I can now see a list of available columns that can be shown/hidden.
2) I don't see any direct column for \"Number of Orders\".
3) The most logical path is to go to the Sales section where we can see all orders.
4) From the accessibility tree, I can see the \"SALES\" link with bid \"183\" in the main navigation.

Let me click on the SALES link.'''

Example output:
'''Clicked the SALES link to access the Orders section for customer order histories.'''
";

const SAME_TASK_SYSTEM: &str =
    "You are an expert in navigating the web, your task is to check if the two workflows refer to the same task.";
const SAME_TASK_PROMPT: &str =
    "Does the following two workflows refer to the same task? Only return 'yes' or 'no', do not provide any additional information.";
const BETTER_SYSTEM: &str = "You are an expert in navigating the web, your task is to select the better navigation guidance workflow between the two workflows provided.";
const BETTER_PROMPT: &str = "Which workflow is more helpful in guiding web navigation? Only return 'Workflow 1' or 'Workflow 2', do not provide any additional information.";

const DEFAULT_ACTION_SYSTEM: &str = "You are a proficient software engineer. Your task is to (1) summarize reusable functions as APIs from the provided action trajectories, and (2) rewrite the trajectories using the reusable functions you summarized.";
const DEFAULT_ACTION_INSTRUCTION: &str = "For each reusable function, write a Python function whose docstring has a description followed by an 'Examples:' section. Only compose the available actions with literal arguments. Put each function in its own ```python block. Then, under a '## Rewritten Trajectories' heading, rewrite each example trajectory with the new functions, one ```python block per trajectory.";
const DEFAULT_MEMORY_SYSTEM: &str = "You are a proficient web navigator. Your task is to extract common workflows from the provided web navigation trajectories.";
const DEFAULT_MEMORY_INSTRUCTION: &str = "Write each workflow inside triple quotes (\"\"\"), starting with a 'Task:' line followed by an 'Action Trajectory:' section listing the steps.";

/// Chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat completions client
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_retries: u32,
}

impl LlmClient {
    pub fn new(base_url: &str, api_key: Option<&str>, model: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(|s| s.to_string()),
            model: model.to_string(),
            max_retries: 2,
        }
    }

    /// Create from config
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.llm_base_url, config.api_key.as_deref(), &config.model)
    }

    /// Check if API key is configured
    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// `n` choices for one request
    pub async fn complete(&self, messages: &[Message], temperature: f32, n: usize) -> Result<Vec<String>> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("OPENROUTER_API_KEY not set - LLM calls unavailable"))?;
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature,
            n: (n > 1).then_some(n),
        };

        debug!(model = %self.model, messages = messages.len(), n, "Calling chat completions");
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(tokio::time::Duration::from_millis(500 * attempt as u64)).await;
            }

            let response = self
                .client
                .post(&url)
                .bearer_auth(api_key)
                .json(&request)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let body: ChatResponse = resp.json().await.context("Unexpected response format")?;
                    let contents: Vec<String> = body
                        .choices
                        .into_iter()
                        .filter_map(|c| c.message.content)
                        .collect();
                    info!(model = %self.model, choices = contents.len(), "LLM response");
                    return Ok(contents);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let error_text = resp.text().await.unwrap_or_default();
                    warn!(%status, attempt, "LLM API error");
                    last_error = Some(anyhow::anyhow!("LLM API error {}: {}", status, error_text));
                }
                Err(e) => {
                    warn!(error = %e, attempt, "LLM request failed");
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Unknown error")))
    }

    /// `n` responses, one request per response when the provider cannot batch
    pub async fn complete_many(&self, messages: &[Message], temperature: f32, n: usize) -> Result<Vec<String>> {
        let mut responses = self.complete(messages, temperature, n).await?;
        while responses.len() < n {
            let mut more = self.complete(messages, temperature, 1).await?;
            if more.is_empty() {
                break;
            }
            responses.append(&mut more);
        }
        responses.truncate(n.max(1));
        Ok(responses)
    }

    /// First choice of a single request
    pub async fn chat(&self, messages: &[Message], temperature: f32) -> Result<String> {
        self.complete(messages, temperature, 1)
            .await?
            .into_iter()
            .next()
            .context("LLM returned no choices")
    }
}

/// Prompt file, falling back to a built-in text
fn load_prompt(dir: &Path, name: &str, fallback: &str) -> String {
    match fs::read_to_string(dir.join(name)) {
        Ok(text) => text,
        Err(_) => {
            debug!(prompt = name, "Using built-in prompt");
            fallback.to_string()
        }
    }
}

/// Which induction prompt set to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InductionKind {
    Actions,
    Workflows,
}

/// Induction prompts of one website
#[derive(Debug, Clone)]
pub struct InductionPrompts {
    pub system: String,
    pub instruction: String,
    pub few_shot: String,
    kind: InductionKind,
}

impl InductionPrompts {
    /// `system_message[_memory].txt`, `instruction[_memory].txt`, `<website>[_memory].md`
    pub fn load(dir: &Path, website: &str, kind: InductionKind) -> Self {
        let (system, instruction, suffix) = match kind {
            InductionKind::Actions => (DEFAULT_ACTION_SYSTEM, DEFAULT_ACTION_INSTRUCTION, ""),
            InductionKind::Workflows => (DEFAULT_MEMORY_SYSTEM, DEFAULT_MEMORY_INSTRUCTION, "_memory"),
        };
        Self {
            system: load_prompt(dir, &format!("system_message{}.txt", suffix), system),
            instruction: load_prompt(dir, &format!("instruction{}.txt", suffix), instruction),
            few_shot: load_prompt(dir, &format!("{}{}.md", website, suffix), ""),
            kind,
        }
    }

    /// Message list for a query; `existing` is the current store or memory
    pub fn messages(&self, query: &str, existing: &str) -> Vec<Message> {
        let mut messages = vec![Message::system(&self.system), Message::user(&self.instruction)];
        if !self.few_shot.is_empty() {
            messages.push(Message::user(&self.few_shot));
        }
        match self.kind {
            InductionKind::Actions => {
                if !existing.trim().is_empty() {
                    messages.push(Message::user(format!("## Existing Actions\n{}", existing)));
                }
                messages.push(Message::user(format!("{}\n\n## Reusable Functions", query)));
            }
            InductionKind::Workflows => {
                messages.push(Message::user(format!("## Existing Workflows\n{}", existing)));
                messages.push(Message::user(format!("{}\n\n## Reusable Workflows", query)));
            }
        }
        messages
    }
}

/// Responses cached as `<dir>/<i>.md` holding `query + "\n\n\n" + response`
#[derive(Debug, Clone)]
pub struct ResponseCache {
    dir: PathBuf,
}

impl ResponseCache {
    /// `outputs/<website>/<key>_task-<ids joined by '-'>`
    pub fn for_tasks(outputs_dir: &Path, website: &str, key: &str, task_ids: &[String]) -> Self {
        Self {
            dir: outputs_dir
                .join(website)
                .join(format!("{}_task-{}", key, task_ids.join("-"))),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cached responses in index order, if the directory exists
    pub fn load(&self) -> Result<Option<Vec<String>>> {
        if !self.dir.is_dir() {
            return Ok(None);
        }
        let mut files: Vec<(u64, PathBuf)> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter_map(|p| {
                let index = p.file_stem()?.to_str()?.parse().ok()?;
                Some((index, p))
            })
            .collect();
        files.sort();
        let mut responses = Vec::with_capacity(files.len());
        for (_, path) in files {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read cached response: {}", path.display()))?;
            responses.push(text);
        }
        info!(dir = %self.dir.display(), responses = responses.len(), "Loaded cached responses");
        Ok(Some(responses))
    }

    pub fn store(&self, query: &str, responses: &[String]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        for (i, response) in responses.iter().enumerate() {
            let path = self.dir.join(format!("{}.md", i));
            fs::write(&path, format!("{}\n\n\n{}", query, response))
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        Ok(())
    }
}

/// Model-backed action proposer
pub struct LlmSkillProposer {
    client: LlmClient,
    prompts: InductionPrompts,
    temperature: f32,
    num_responses: usize,
    cache: Option<ResponseCache>,
}

impl LlmSkillProposer {
    pub fn new(client: LlmClient, prompts: InductionPrompts, temperature: f32, num_responses: usize) -> Self {
        Self {
            client,
            prompts,
            temperature,
            num_responses,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }
}

#[async_trait]
impl SkillProposer for LlmSkillProposer {
    async fn propose(&self, query: &str, existing_source: &str) -> Result<Vec<String>> {
        if let Some(ref cache) = self.cache {
            if let Some(responses) = cache.load()? {
                return Ok(responses);
            }
        }
        let messages = self.prompts.messages(query, existing_source);
        let responses = self
            .client
            .complete_many(&messages, self.temperature, self.num_responses)
            .await?;
        if let Some(ref cache) = self.cache {
            cache.store(query, &responses)?;
        }
        Ok(responses)
    }
}

/// Model-backed workflow comparator
pub struct LlmWorkflowComparator {
    client: LlmClient,
    temperature: f32,
}

impl LlmWorkflowComparator {
    pub fn new(client: LlmClient, temperature: f32) -> Self {
        Self { client, temperature }
    }
}

#[async_trait]
impl WorkflowComparator for LlmWorkflowComparator {
    async fn same_task(&self, new_name: &str, existing_name: &str) -> Result<bool> {
        let messages = [
            Message::system(SAME_TASK_SYSTEM),
            Message::user(SAME_TASK_PROMPT),
            Message::user(format!("Workflow 1: {}\nWorkflow 2: {}", new_name, existing_name)),
        ];
        let answer = self.client.chat(&messages, self.temperature).await?;
        let same = parse_yes_no(&answer);
        debug!(new = new_name, existing = existing_name, same, "Checked workflow overlap");
        Ok(same)
    }

    async fn better(&self, new: &str, existing: &str) -> Result<Preference> {
        let messages = [
            Message::system(BETTER_SYSTEM),
            Message::user(BETTER_PROMPT),
            Message::user(format!("Workflow 1:\n{}\nWorkflow 2:\n{}", new, existing)),
        ];
        let answer = self.client.chat(&messages, self.temperature).await?;
        Ok(parse_preference(&answer))
    }
}

/// Model-backed thought summarizer, deterministic sampling
pub struct LlmThoughtSummarizer {
    client: LlmClient,
}

impl LlmThoughtSummarizer {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ThoughtSummarizer for LlmThoughtSummarizer {
    async fn summarize(&self, text: &str) -> Result<String> {
        let messages = [Message::system(SIMPLIFY_THOUGHT_PROMPT), Message::user(text)];
        self.client.chat(&messages, 0.0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_action_messages() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("shopping.md"), "few shot").unwrap();
        let prompts = InductionPrompts::load(dir.path(), "shopping", InductionKind::Actions);
        let messages = prompts.messages("## Task: x", "");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[2].content, "few shot");
        assert_eq!(messages[3].content, "## Task: x\n\n## Reusable Functions");

        let with_store = prompts.messages("## Task: x", "def a():\n    pass");
        assert_eq!(with_store[3].content, "## Existing Actions\ndef a():\n    pass");
    }

    #[test]
    fn test_workflow_messages() {
        let dir = TempDir::new().unwrap();
        let prompts = InductionPrompts::load(dir.path(), "map", InductionKind::Workflows);
        let messages = prompts.messages("## Task: y", "");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].content, "## Existing Workflows\n");
        assert!(messages[3].content.ends_with("## Reusable Workflows"));
    }

    #[test]
    fn test_response_cache() {
        let dir = TempDir::new().unwrap();
        let ids = vec!["21".to_string(), "22".to_string()];
        let cache = ResponseCache::for_tasks(dir.path(), "shopping", "action", &ids);
        assert!(cache.dir().ends_with("shopping/action_task-21-22"));
        assert!(cache.load().unwrap().is_none());

        let responses: Vec<String> = (0..11).map(|i| format!("r{}", i)).collect();
        cache.store("q", &responses).unwrap();
        let loaded = cache.load().unwrap().unwrap();
        assert_eq!(loaded.len(), 11);
        assert_eq!(loaded[0], "q\n\n\nr0");
        assert_eq!(loaded[10], "q\n\n\nr10");
    }

    #[tokio::test]
    async fn test_missing_key() {
        let client = LlmClient::new(UNREACHABLE_URL, None, "m");
        assert!(!client.is_available());
        assert!(client.chat(&[Message::user("hi")], 0.0).await.is_err());
    }

    const UNREACHABLE_URL: &str = "http://127.0.0.1:9";
}
