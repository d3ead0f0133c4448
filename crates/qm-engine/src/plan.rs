use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("no fenced json task block found in plan output")]
    NoTaskBlock,
    #[error("invalid task block: {0}")]
    InvalidBlock(String),
    #[error("duplicate task id `{0}` in plan")]
    DuplicateId(String),
    #[error("task `{task}` depends on unknown task `{dep}`")]
    UnknownDependency { task: String, dep: String },
    #[error("plan contains no tasks")]
    Empty,
}

// ---------------------------------------------------------------------------
// PlanTask
// ---------------------------------------------------------------------------

/// One entry of the machine-readable task list the plan phase emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    pub name: String,
    pub agent: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
}

fn default_timeout_s() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Extract the contents of every ```` ```json ```` fenced block.
fn extract_json_blocks(markdown: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;
    for line in markdown.lines() {
        let trimmed = line.trim();
        match &mut current {
            None => {
                if trimmed == "```json" {
                    current = Some(String::new());
                }
            }
            Some(buf) => {
                if trimmed == "```" {
                    blocks.push(std::mem::take(buf));
                    current = None;
                } else {
                    buf.push_str(line);
                    buf.push('\n');
                }
            }
        }
    }
    blocks
}

/// Parse a plan document (or a concatenation of `tasks/*.md` files) into the
/// validated task list. Each fenced json block holds either one task object
/// or an array of them.
pub fn parse_plan(markdown: &str) -> Result<Vec<PlanTask>, PlanError> {
    let blocks = extract_json_blocks(markdown);
    if blocks.is_empty() {
        return Err(PlanError::NoTaskBlock);
    }

    let mut tasks: Vec<PlanTask> = Vec::new();
    for block in blocks {
        let value: serde_json::Value =
            serde_json::from_str(&block).map_err(|e| PlanError::InvalidBlock(e.to_string()))?;
        match value {
            serde_json::Value::Array(items) => {
                for item in items {
                    tasks.push(
                        serde_json::from_value(item)
                            .map_err(|e| PlanError::InvalidBlock(e.to_string()))?,
                    );
                }
            }
            obj @ serde_json::Value::Object(_) => {
                tasks.push(
                    serde_json::from_value(obj)
                        .map_err(|e| PlanError::InvalidBlock(e.to_string()))?,
                );
            }
            other => {
                return Err(PlanError::InvalidBlock(format!(
                    "expected object or array, got {other}"
                )));
            }
        }
    }

    validate(&tasks)?;
    Ok(tasks)
}

fn validate(tasks: &[PlanTask]) -> Result<(), PlanError> {
    if tasks.is_empty() {
        return Err(PlanError::Empty);
    }
    let mut ids = BTreeSet::new();
    for task in tasks {
        if task.id.trim().is_empty() {
            return Err(PlanError::InvalidBlock("task with empty id".to_string()));
        }
        if !ids.insert(task.id.as_str()) {
            return Err(PlanError::DuplicateId(task.id.clone()));
        }
    }
    for task in tasks {
        for dep in &task.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    task: task.id.clone(),
                    dep: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Render one task as its `tasks/<task-id>.md` artifact.
pub fn render_task_md(task: &PlanTask) -> String {
    let json = serde_json::to_string_pretty(task).expect("plan task serializes");
    format!("# {}\n\n```json\n{json}\n```\n", task.name)
}

/// Render a whole plan document carrying every task block. Parsing the
/// result yields the input list unchanged.
pub fn render_plan_doc(title: &str, tasks: &[PlanTask]) -> String {
    let mut doc = format!("# {title}\n");
    for task in tasks {
        doc.push('\n');
        doc.push_str(&render_task_md(task));
    }
    doc
}

/// Remap every task id (and dependency reference) with a `r<revision>-`
/// prefix so replanned task ids never collide with a previous generation.
pub fn remap_revision(tasks: Vec<PlanTask>, revision: u32) -> Vec<PlanTask> {
    if revision <= 1 {
        return tasks;
    }
    tasks
        .into_iter()
        .map(|mut t| {
            t.id = format!("r{revision}-{}", t.id);
            t.depends_on = t
                .depends_on
                .into_iter()
                .map(|d| format!("r{revision}-{d}"))
                .collect();
            t
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn task(id: &str, deps: &[&str]) -> PlanTask {
        PlanTask {
            id: id.to_string(),
            name: format!("do {id}"),
            agent: "claude".to_string(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            timeout_s: 600,
        }
    }

    #[test]
    fn parses_single_object_block() {
        let md = "intro text\n\n```json\n{ \"id\": \"task-01\", \"name\": \"scan\", \
                  \"agent\": \"claude\", \"depends_on\": [], \"timeout_s\": 600 }\n```\n";
        let tasks = parse_plan(md).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "task-01");
        assert_eq!(tasks[0].agent, "claude");
    }

    #[test]
    fn parses_array_block_with_defaults() {
        let md = "```json\n[\n  {\"id\": \"task-00\", \"name\": \"a\", \"agent\": \"gemini\"},\n  \
                  {\"id\": \"task-01\", \"name\": \"b\", \"agent\": \"codex\", \"depends_on\": [\"task-00\"]}\n]\n```";
        let tasks = parse_plan(md).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].timeout_s, 600);
        assert_eq!(tasks[1].depends_on, vec!["task-00"]);
    }

    #[test]
    fn missing_block_is_an_error() {
        assert!(matches!(parse_plan("just prose"), Err(PlanError::NoTaskBlock)));
    }

    #[test]
    fn malformed_json_is_an_error() {
        let md = "```json\n{ not json }\n```";
        assert!(matches!(parse_plan(md), Err(PlanError::InvalidBlock(_))));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let doc = render_plan_doc("p", &[task("task-01", &[]), task("task-01", &[])]);
        assert!(matches!(parse_plan(&doc), Err(PlanError::DuplicateId(_))));
    }

    #[test]
    fn dangling_dependency_rejected() {
        let doc = render_plan_doc("p", &[task("task-01", &["task-99"])]);
        assert!(matches!(
            parse_plan(&doc),
            Err(PlanError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn render_then_parse_is_identity() {
        let tasks = vec![
            task("task-00", &[]),
            task("task-01", &["task-00"]),
            task("task-02", &["task-00", "task-01"]),
        ];
        let doc = render_plan_doc("execution plan", &tasks);
        assert_eq!(parse_plan(&doc).unwrap(), tasks);
    }

    #[test]
    fn revision_remap_rewrites_deps() {
        let remapped = remap_revision(vec![task("task-00", &[]), task("task-01", &["task-00"])], 2);
        assert_eq!(remapped[0].id, "r2-task-00");
        assert_eq!(remapped[1].depends_on, vec!["r2-task-00"]);
        // Revision 1 is the identity.
        let same = remap_revision(vec![task("task-00", &[])], 1);
        assert_eq!(same[0].id, "task-00");
    }

    proptest! {
        /// Serialize -> parse over the plan block schema is the identity.
        #[test]
        fn roundtrip_law(
            ids in proptest::collection::btree_set("[a-z][a-z0-9-]{0,12}", 1..6),
            agent in "(claude|gemini|codex|gpt)",
            timeout_s in 1u64..7200,
        ) {
            let ids: Vec<String> = ids.into_iter().collect();
            // Wire each task to depend on the previous one: always a valid DAG.
            let tasks: Vec<PlanTask> = ids
                .iter()
                .enumerate()
                .map(|(i, id)| PlanTask {
                    id: id.clone(),
                    name: format!("step {id}"),
                    agent: agent.clone(),
                    depends_on: if i == 0 { vec![] } else { vec![ids[i - 1].clone()] },
                    timeout_s,
                })
                .collect();
            let doc = render_plan_doc("plan", &tasks);
            prop_assert_eq!(parse_plan(&doc).unwrap(), tasks);
        }
    }
}
