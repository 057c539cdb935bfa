//! Skill Induction Integration Tests
//!
//! Full propose, stage, replay and commit or revert cycle over a real
//! action store, with the model and the browser replaced by stubs.

use anyhow::{bail, Result};
use asi_agent::skills::{
    ActionRegistry, ActionStore, InductionConfig, InductionOutcome, ReplayRun, ReplayRunner,
    ReplayScript, SkillInducer, SkillProposer, TaskExample,
};
use asi_agent::{Step, Trajectory};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const EXISTING: &str = r#"def open_orders(menu_id: str):
    """Open the order history page.

    Examples:
        open_orders('227')
    """
    click(menu_id)
    scroll(0, 300)"#;

const RESPONSE: &str = r#"The examples share a search routine.

```python
def search_product(search_box_id: str, query: str):
    """Search for a product from the search box.

    Examples:
        search_product('595', 'xbox')
    """
    click(search_box_id)
    fill(search_box_id, query)
    keyboard_press('Enter')
```

## Rewritten Trajectories

```python
# search for the product
search_product('595', 'xbox')
send_msg_to_user('done')
```

```python
click('12')
search_product('595', 'ps5')
```
"#;

const NO_TESTS: &str = r#"```python
def add_to_cart(button_id: str, qty: str):
    """Add the product to the cart.

    Examples:
        add_to_cart('1510', '2')
    """
    fill('1509', qty)
    click(button_id)
```
"#;

struct CannedProposer {
    responses: Vec<String>,
    queries: Mutex<Vec<String>>,
}

impl CannedProposer {
    fn new(responses: &[&str]) -> Self {
        Self {
            responses: responses.iter().map(|r| r.to_string()).collect(),
            queries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SkillProposer for CannedProposer {
    async fn propose(&self, query: &str, _existing_source: &str) -> Result<Vec<String>> {
        self.queries.lock().push(query.to_string());
        Ok(self.responses.clone())
    }
}

#[derive(Clone, Copy)]
enum Behaviour {
    Pass,
    TaskFails,
    StepErrors,
    Hangs,
    Crashes,
}

/// Replays each script line as one observed step
struct StubRunner {
    behaviour: Behaviour,
    runs: Mutex<Vec<ReplayScript>>,
    discarded: Mutex<Vec<String>>,
}

impl StubRunner {
    fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            runs: Mutex::new(Vec::new()),
            discarded: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ReplayRunner for StubRunner {
    async fn run(&self, script: &ReplayScript) -> Result<ReplayRun> {
        self.runs.lock().push(script.clone());
        match self.behaviour {
            Behaviour::Hangs => tokio::time::sleep(Duration::from_secs(30)).await,
            Behaviour::Crashes => bail!("browser exited with status 1"),
            _ => {}
        }

        let mut steps = vec![Step::new("", "start page")];
        for (i, line) in script.steps.iter().enumerate() {
            let mut step = Step::new(line.clone(), format!("page {}", i + 1));
            if matches!(self.behaviour, Behaviour::StepErrors) {
                step = step.with_error("ValueError: element 595 not found");
            }
            steps.push(step);
        }
        Ok(ReplayRun {
            trajectory: Trajectory::new(steps),
            task_success: !matches!(self.behaviour, Behaviour::TaskFails),
        })
    }

    async fn discard(&self, task_id: &str) -> Result<()> {
        self.discarded.lock().push(task_id.to_string());
        Ok(())
    }
}

fn seeded_store(dir: &TempDir) -> ActionStore {
    let store = ActionStore::open(dir.path(), "shopping").unwrap();
    fs::write(store.path(), EXISTING).unwrap();
    store
}

fn task_ids() -> Vec<String> {
    vec!["21".to_string(), "22".to_string()]
}

fn short_timeout() -> InductionConfig {
    InductionConfig {
        replay_timeout: Duration::from_millis(200),
        ..InductionConfig::default()
    }
}

#[tokio::test]
async fn test_commit_appends_proposal() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(&dir);
    let proposer = CannedProposer::new(&[RESPONSE]);
    let runner = StubRunner::new(Behaviour::Pass);

    let examples = vec![TaskExample {
        task_id: "21".to_string(),
        instruction: "Search for xbox".to_string(),
        task: "Search for {{product}}".to_string(),
        steps: vec!["click('595')".to_string(), "fill('595', 'xbox')".to_string()],
    }];
    let outcome = SkillInducer::new(&store, &proposer, &runner)
        .induce(&examples, &task_ids())
        .await
        .unwrap();

    assert!(outcome.is_committed());
    match &outcome {
        InductionOutcome::Committed { response_index, names, version } => {
            assert_eq!(*response_index, 0);
            assert_eq!(names, &vec!["search_product".to_string()]);
            assert_eq!(version, &store.version().unwrap());
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let content = store.read().unwrap();
    assert!(content.starts_with(&format!("{}\n\ndef search_product(", EXISTING)));
    assert!(content.contains("keyboard_press('Enter')"));
    assert_eq!(store.history().unwrap().len(), 1);

    // replays were cut right after the first use of the new action
    let runs = runner.runs.lock();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].task_id, "21");
    assert_eq!(runs[0].steps, vec!["search_product('595', 'xbox')"]);
    assert_eq!(runs[1].task_id, "22");
    assert_eq!(runs[1].steps, vec!["click('12')", "search_product('595', 'ps5')"]);
    assert!(runner.discarded.lock().is_empty());

    assert!(proposer.queries.lock()[0].starts_with("## Task: Search for {{product}}\n### Example 1 (21):"));

    // the committed store builds and exposes the new action
    let registry = ActionRegistry::builder()
        .subsets(["webarena", "shopping"])
        .actions_dir(dir.path())
        .build()
        .unwrap();
    assert!(registry.contains("search_product"));
    assert!(registry.contains("open_orders"));
}

async fn assert_reverts(behaviour: Behaviour) {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(&dir);
    let before = fs::read(store.path()).unwrap();
    let proposer = CannedProposer::new(&[RESPONSE]);
    let runner = StubRunner::new(behaviour);

    let outcome = SkillInducer::new(&store, &proposer, &runner)
        .with_config(short_timeout())
        .evaluate_responses(&proposer.responses, &task_ids())
        .await
        .unwrap();

    assert_eq!(outcome, InductionOutcome::Reverted);
    assert_eq!(fs::read(store.path()).unwrap(), before);
    assert!(store.history().unwrap().is_empty());
    // the first failing replay stops the batch
    assert_eq!(runner.runs.lock().len(), 1);
    assert_eq!(*runner.discarded.lock(), vec!["21".to_string(), "22".to_string()]);
}

#[tokio::test]
async fn test_failed_task_reverts() {
    assert_reverts(Behaviour::TaskFails).await;
}

#[tokio::test]
async fn test_step_error_reverts() {
    assert_reverts(Behaviour::StepErrors).await;
}

#[tokio::test]
async fn test_replay_timeout_reverts() {
    assert_reverts(Behaviour::Hangs).await;
}

#[tokio::test]
async fn test_runner_error_reverts() {
    assert_reverts(Behaviour::Crashes).await;
}

#[tokio::test]
async fn test_later_response_can_commit() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(&dir);
    let proposer = CannedProposer::new(&[NO_TESTS, RESPONSE]);
    let runner = StubRunner::new(Behaviour::Pass);

    let outcome = SkillInducer::new(&store, &proposer, &runner)
        .evaluate_responses(&proposer.responses, &task_ids())
        .await
        .unwrap();

    match outcome {
        InductionOutcome::Committed { response_index, .. } => assert_eq!(response_index, 1),
        other => panic!("unexpected outcome: {:?}", other),
    }
    let content = store.read().unwrap();
    assert!(!content.contains("add_to_cart"));
    assert!(content.contains("def search_product("));
}

#[tokio::test]
async fn test_existing_names_are_not_proposed() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(&dir);
    let before = store.read().unwrap();
    let response = RESPONSE.replace("search_product", "open_orders");
    let proposer = CannedProposer::new(&[response.as_str()]);
    let runner = StubRunner::new(Behaviour::Pass);

    let outcome = SkillInducer::new(&store, &proposer, &runner)
        .evaluate_responses(&proposer.responses, &task_ids())
        .await
        .unwrap();

    assert_eq!(outcome, InductionOutcome::NoProposals);
    assert_eq!(store.read().unwrap(), before);
    assert!(runner.runs.lock().is_empty());
}

#[tokio::test]
async fn test_no_examples_is_nothing_to_learn() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(&dir);
    let proposer = CannedProposer::new(&[RESPONSE]);
    let runner = StubRunner::new(Behaviour::Pass);

    let outcome = SkillInducer::new(&store, &proposer, &runner)
        .induce(&[], &task_ids())
        .await
        .unwrap();

    assert_eq!(outcome, InductionOutcome::NothingToLearn);
    assert!(proposer.queries.lock().is_empty());
}
