//! Recipe/DAG executor (C8): loads a YAML workflow, topologically
//! schedules its steps, interpolates variables, retries transport-class
//! failures, and aggregates a summary.

pub mod template;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, Semaphore};

use crate::dispatch::{DispatchRequest, Dispatcher};
use crate::error::RecipeError;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RetrySpec {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_sec")]
    pub backoff_sec: u64,
    #[serde(default)]
    pub jitter: u64,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_backoff_sec() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    pub name: String,
    pub tool: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub params_file: Option<String>,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub when: Option<Value>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetrySpec>,
    #[serde(default)]
    pub save_as: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Recipe {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    pub steps: Vec<Step>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RecipeFile {
    Named { recipes: HashMap<String, Recipe> },
    Bare(Recipe),
}

impl Recipe {
    pub fn load(path: &Path, name: Option<&str>) -> Result<Self, RecipeError> {
        let raw = std::fs::read_to_string(path).map_err(|e| RecipeError::Parse(e.to_string()))?;
        let file: RecipeFile = serde_yml::from_str(&raw).map_err(|e| RecipeError::Parse(e.to_string()))?;
        let recipe = match file {
            RecipeFile::Bare(r) => r,
            RecipeFile::Named { mut recipes } => {
                let key = name.ok_or_else(|| {
                    RecipeError::Parse("file defines multiple recipes; --name is required".to_string())
                })?;
                recipes
                    .remove(key)
                    .ok_or_else(|| RecipeError::Parse(format!("no recipe named {key}")))?
            }
        };
        recipe.validate()?;
        Ok(recipe)
    }

    fn validate(&self) -> Result<(), RecipeError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.clone()) {
                return Err(RecipeError::DuplicateStep(step.name.clone()));
            }
            if step.params.is_some() == step.params_file.is_some() {
                return Err(RecipeError::AmbiguousParams(step.name.clone()));
            }
        }
        for step in &self.steps {
            for need in &step.needs {
                if !seen.contains(need) {
                    return Err(RecipeError::UnknownDependency {
                        step: step.name.clone(),
                        needs: need.clone(),
                    });
                }
            }
        }
        plan(self)?;
        Ok(())
    }
}

/// Topological order over `needs`, ties broken by declaration order.
pub fn plan(recipe: &Recipe) -> Result<Vec<String>, RecipeError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &recipe.steps {
        in_degree.entry(step.name.as_str()).or_insert(0);
        for need in &step.needs {
            *in_degree.entry(step.name.as_str()).or_insert(0) += 1;
            dependents.entry(need.as_str()).or_default().push(step.name.as_str());
        }
    }

    let mut ready: Vec<&str> = recipe
        .steps
        .iter()
        .map(|s| s.name.as_str())
        .filter(|n| in_degree[n] == 0)
        .collect();
    let mut order = Vec::new();

    while let Some(&name) = ready.first() {
        ready.remove(0);
        order.push(name.to_string());
        if let Some(deps) = dependents.get(name) {
            for &dep in deps {
                let degree = in_degree.get_mut(dep).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready.push(dep);
                }
            }
        }
    }

    if order.len() != recipe.steps.len() {
        return Err(RecipeError::Cycle);
    }
    Ok(order)
}

#[derive(Debug, Clone, PartialEq)]
enum StepState {
    Pending,
    SkippedSuccess,
    SkippedFailed,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub ok: bool,
    pub skipped: bool,
    pub dur_sec: f64,
    pub save_as: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub ok: bool,
    pub steps: HashMap<String, StepSummary>,
    pub audit: Value,
    pub plan: Vec<String>,
}

pub struct RecipeExecutorOptions {
    pub parallelism: usize,
    pub default_timeout_sec: u64,
    pub continue_on_error: bool,
    pub dry_run: bool,
    pub role: String,
    /// Vars loaded from a `--vars-file`; override `recipe.vars`, overridden by `cli_vars`.
    pub file_vars: HashMap<String, String>,
    pub cli_vars: HashMap<String, String>,
    pub recipe_dir: PathBuf,
}

struct SharedState {
    context: Value,
    states: HashMap<String, StepState>,
    summaries: HashMap<String, StepSummary>,
    failed_any: bool,
    actions: Vec<Value>,
    diffs: Vec<Value>,
}

pub async fn execute(
    recipe: &Recipe,
    dispatcher: Arc<Dispatcher>,
    opts: RecipeExecutorOptions,
) -> Result<RunSummary, RecipeError> {
    let order = plan(recipe)?;
    let steps_by_name: HashMap<String, &Step> =
        recipe.steps.iter().map(|s| (s.name.clone(), s)).collect();

    let mut vars = recipe.vars.clone();
    vars.extend(opts.file_vars.clone());
    vars.extend(opts.cli_vars.clone());

    let shared = Arc::new(Mutex::new(SharedState {
        context: json!({"steps": {}, "vars": vars.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect::<serde_json::Map<_, _>>()}),
        states: order.iter().map(|n| (n.clone(), StepState::Pending)).collect(),
        summaries: HashMap::new(),
        failed_any: false,
        actions: Vec::new(),
        diffs: Vec::new(),
    }));

    let semaphore = Arc::new(Semaphore::new(opts.parallelism.max(1)));
    let mut remaining: Vec<String> = order.clone();

    while !remaining.is_empty() {
        let (current, still_pending) = ready_batch(&remaining, &steps_by_name, &shared).await;
        remaining = still_pending;
        if current.is_empty() {
            // Nothing ready and nothing left runnable: remaining steps are
            // blocked on failed dependencies; resolve them as skipped-failed.
            resolve_blocked(&remaining, &steps_by_name, &shared).await;
            break;
        }

        let mut handles = Vec::new();
        for name in current {
            let step = steps_by_name[&name].clone_for_task();
            let permit = semaphore.clone();
            let shared = shared.clone();
            let dispatcher = dispatcher.clone();
            let vars = vars.clone();
            let opts_role = opts.role.clone();
            let opts_dry_run = opts.dry_run;
            let default_timeout = opts.default_timeout_sec;
            let recipe_dir = opts.recipe_dir.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.unwrap();
                run_step(
                    &step,
                    &shared,
                    &dispatcher,
                    &vars,
                    &opts_role,
                    opts_dry_run,
                    default_timeout,
                    &recipe_dir,
                )
                .await
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        let failed = shared.lock().await.failed_any;
        if failed && !opts.continue_on_error {
            resolve_blocked(&remaining, &steps_by_name, &shared).await;
            break;
        }
    }

    let shared = shared.lock().await;
    let ok = !shared.failed_any || opts.continue_on_error && shared.summaries.values().any(|s| s.ok);
    Ok(RunSummary {
        ok: if opts.continue_on_error {
            shared.summaries.values().all(|s| s.ok || s.skipped)
        } else {
            ok
        },
        steps: shared.summaries.clone(),
        audit: json!({"actions": shared.actions, "diffs": shared.diffs}),
        plan: order,
    })
}

impl Step {
    fn clone_for_task(&self) -> Step {
        self.clone()
    }
}

async fn ready_batch(
    remaining: &[String],
    steps_by_name: &HashMap<String, &Step>,
    shared: &Arc<Mutex<SharedState>>,
) -> (Vec<String>, Vec<String>) {
    let state = shared.lock().await;
    let mut ready = Vec::new();
    let mut still_pending = Vec::new();
    for name in remaining {
        let step = steps_by_name[name];
        let deps_done = step.needs.iter().all(|n| {
            !matches!(state.states.get(n), Some(StepState::Pending) | None)
        });
        if deps_done {
            ready.push(name.clone());
        } else {
            still_pending.push(name.clone());
        }
    }
    (ready, still_pending)
}

async fn resolve_blocked(
    remaining: &[String],
    steps_by_name: &HashMap<String, &Step>,
    shared: &Arc<Mutex<SharedState>>,
) {
    let mut state = shared.lock().await;
    for name in remaining {
        state.states.insert(name.clone(), StepState::SkippedFailed);
        state.summaries.insert(
            name.clone(),
            StepSummary {
                ok: false,
                skipped: true,
                dur_sec: 0.0,
                save_as: steps_by_name.get(name).and_then(|s| s.save_as.clone()),
            },
        );
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_step(
    step: &Step,
    shared: &Arc<Mutex<SharedState>>,
    dispatcher: &Arc<Dispatcher>,
    vars: &HashMap<String, String>,
    role: &str,
    dry_run: bool,
    default_timeout_sec: u64,
    recipe_dir: &Path,
) {
    let start = std::time::Instant::now();

    let any_dep_failed = {
        let state = shared.lock().await;
        step.needs.iter().any(|n| {
            matches!(
                state.states.get(n),
                Some(StepState::Failed) | Some(StepState::SkippedFailed)
            )
        })
    };
    if any_dep_failed {
        let mut state = shared.lock().await;
        state.states.insert(step.name.clone(), StepState::SkippedFailed);
        state.summaries.insert(
            step.name.clone(),
            StepSummary {
                ok: false,
                skipped: true,
                dur_sec: start.elapsed().as_secs_f64(),
                save_as: step.save_as.clone(),
            },
        );
        return;
    }

    let context = shared.lock().await.context.clone();

    if let Some(when) = &step.when {
        let should_run = evaluate_when(when, &context, vars);
        if !should_run {
            let mut state = shared.lock().await;
            state.states.insert(step.name.clone(), StepState::SkippedSuccess);
            publish_step_result(&mut state, &step.name, true, true, Value::Null);
            state.summaries.insert(
                step.name.clone(),
                StepSummary {
                    ok: true,
                    skipped: true,
                    dur_sec: start.elapsed().as_secs_f64(),
                    save_as: step.save_as.clone(),
                },
            );
            return;
        }
    }

    let raw_params = match step.params.clone() {
        Some(p) => Ok(p),
        None => load_params_file(step, recipe_dir),
    };
    let raw_params = match raw_params {
        Ok(p) => p,
        Err(e) => {
            let mut state = shared.lock().await;
            state.states.insert(step.name.clone(), StepState::Failed);
            state.failed_any = true;
            publish_step_result(&mut state, &step.name, false, false, json!({"error": e.to_string()}));
            state.summaries.insert(
                step.name.clone(),
                StepSummary {
                    ok: false,
                    skipped: false,
                    dur_sec: start.elapsed().as_secs_f64(),
                    save_as: step.save_as.clone(),
                },
            );
            return;
        }
    };
    let rendered_params = match template::render_value(&raw_params, &context, vars) {
        Ok(v) => v,
        Err(e) => {
            let mut state = shared.lock().await;
            state.states.insert(step.name.clone(), StepState::Failed);
            state.failed_any = true;
            publish_step_result(&mut state, &step.name, false, false, json!({"error": e.to_string()}));
            state.summaries.insert(
                step.name.clone(),
                StepSummary {
                    ok: false,
                    skipped: false,
                    dur_sec: start.elapsed().as_secs_f64(),
                    save_as: step.save_as.clone(),
                },
            );
            return;
        }
    };

    let timeout = Duration::from_secs(step.timeout_sec.unwrap_or(default_timeout_sec));
    let retry = step.retry.clone().unwrap_or_default();

    let mut attempt = 0u32;
    let result = loop {
        attempt += 1;
        let request = DispatchRequest {
            tool: step.tool.clone(),
            params: rendered_params.clone(),
            request_id: uuid::Uuid::new_v4().to_string(),
            role: role.to_string(),
            dry_run,
        };
        let dispatch_fut = dispatcher.dispatch(request);
        let response = match tokio::time::timeout(timeout, dispatch_fut).await {
            Ok(v) => v,
            Err(_) => json!({"ok": false, "error": {"code": "TIMEOUT", "message": "step timed out"}}),
        };

        let code = response.get("error").and_then(|e| e.get("code")).and_then(Value::as_str);
        let retriable = matches!(
            code,
            Some("TRANSPORT_ERROR") | Some("CONNECTION_CLOSED") | Some("READ_TIMEOUT") | Some("WRITE_TIMEOUT")
        );

        if retriable && attempt < retry.max_attempts.max(1) {
            let delay = backoff_delay(attempt, &retry);
            tokio::time::sleep(delay).await;
            continue;
        }
        break response;
    };

    let ok = result.get("ok").and_then(Value::as_bool).unwrap_or(false);

    if let Some(save_as) = &step.save_as {
        let out_path = recipe_dir.join(save_as);
        if let Some(parent) = out_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(serialized) = serde_json::to_string_pretty(&result) {
            let _ = std::fs::write(out_path, serialized);
        }
    }

    let mut state = shared.lock().await;
    state.states.insert(
        step.name.clone(),
        if ok { StepState::Succeeded } else { StepState::Failed },
    );
    if !ok {
        state.failed_any = true;
    }
    if let Some(actions) = result.get("audit").and_then(|a| a.get("actions")).and_then(Value::as_array) {
        state.actions.extend(actions.clone());
    }
    if let Some(diffs) = result.get("audit").and_then(|a| a.get("diffs")).and_then(Value::as_array) {
        state.diffs.extend(diffs.clone());
    }
    publish_step_result(&mut state, &step.name, ok, false, result);
    state.summaries.insert(
        step.name.clone(),
        StepSummary {
            ok,
            skipped: false,
            dur_sec: start.elapsed().as_secs_f64(),
            save_as: step.save_as.clone(),
        },
    );
}

/// Resolves `step.params_file` against `recipe_dir` and parses it. Accepts
/// either JSON or YAML, matching the recipe document's own format.
fn load_params_file(step: &Step, recipe_dir: &Path) -> Result<Value, RecipeError> {
    let Some(rel) = &step.params_file else {
        return Ok(Value::Null);
    };
    let path = recipe_dir.join(rel);
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| RecipeError::Parse(format!("step {}: failed to read params_file {}: {e}", step.name, path.display())))?;
    serde_yml::from_str(&raw)
        .map_err(|e| RecipeError::Parse(format!("step {}: failed to parse params_file {}: {e}", step.name, path.display())))
}

fn publish_step_result(state: &mut SharedState, name: &str, ok: bool, skipped: bool, result: Value) {
    if let Value::Object(ref mut root) = state.context {
        let steps = root.entry("steps").or_insert_with(|| json!({}));
        if let Value::Object(ref mut steps_map) = steps {
            steps_map.insert(name.to_string(), json!({"ok": ok, "skipped": skipped, "result": result}));
        }
    }
}

fn evaluate_when(when: &Value, context: &Value, vars: &HashMap<String, String>) -> bool {
    match when {
        Value::Bool(b) => *b,
        Value::String(s) => {
            let rendered = template::render_string(s, context, vars).unwrap_or_else(|_| "false".to_string());
            !matches!(rendered.trim(), "false" | "" | "0")
        }
        _ => true,
    }
}

/// Exponential backoff seeded by `backoff_sec`, capped at 4x the seed, plus
/// uniform jitter in `[0, jitter]`. Deliberately hand-rolled rather than
/// pulled from a retry crate.
fn backoff_delay(attempt: u32, retry: &RetrySpec) -> Duration {
    let seed_ms = retry.backoff_sec.saturating_mul(1000);
    let cap_ms = seed_ms.saturating_mul(4);
    let exp_ms = seed_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let capped_ms = exp_ms.min(cap_ms.max(seed_ms));
    let jitter_ms = if retry.jitter > 0 {
        rand::thread_rng().gen_range(0..=retry.jitter * 1000)
    } else {
        0
    };
    Duration::from_millis(capped_ms + jitter_ms)
}
