//! Workflow templates and the overrides patched into them.
//!
//! Templates are API-format node graphs (`{ "<id>": { "class_type", "inputs" } }`)
//! stored as `<workflows_dir>/<name>.json`. Which templates are offered is decided
//! by `model_map.json`; every name in it must be one of the [`WorkflowKind`]s.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::job::QueueRequest;

pub const MODEL_MAP_FILE: &str = "model_map.json";
const UPSCALE_SUFFIX: &str = ".upscale";
const TEXT_ENCODER: &str = "TextEncode";
const UPSCALER: &str = "UltimateSDUpscale";
const FRAMES_PER_SECOND: i64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkflowKind {
    T2i,
    T2iWan22,
    T2vWan22,
    T2vWan22Lite,
    T2iSdxlTurbo,
}

impl WorkflowKind {
    pub const ALL: [WorkflowKind; 5] = [
        Self::T2i,
        Self::T2iWan22,
        Self::T2vWan22,
        Self::T2vWan22Lite,
        Self::T2iSdxlTurbo,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::T2i => "t2i",
            Self::T2iWan22 => "t2i_wan22",
            Self::T2vWan22 => "t2v_wan22",
            Self::T2vWan22Lite => "t2v_wan22_lite",
            Self::T2iSdxlTurbo => "t2i_SDXL_turbo",
        }
    }

    fn recipe(self) -> &'static WorkflowRecipe {
        match self {
            Self::T2i => &T2I,
            Self::T2iWan22 => &T2I_WAN22,
            Self::T2vWan22 => &T2V_WAN22,
            Self::T2vWan22Lite => &T2V_WAN22_LITE,
            Self::T2iSdxlTurbo => &T2I_SDXL_TURBO,
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WorkflowKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| anyhow!("unknown workflow '{s}'"))
    }
}

/// A `(class_type, input key)` pair. Class matching is by substring, so `KSampler`
/// also addresses `KSamplerAdvanced` nodes that carry the same key.
#[derive(Debug, Clone, Copy)]
struct InputTarget {
    class_type: &'static str,
    key: &'static str,
}

const fn target(class_type: &'static str, key: &'static str) -> InputTarget {
    InputTarget { class_type, key }
}

#[derive(Debug)]
struct WorkflowRecipe {
    template: &'static str,
    upscale_variant: bool,
    /// Node type whose `positive`/`negative` links lead to the prompt encoders.
    condition_root: &'static str,
    checkpoint: Option<InputTarget>,
    latent: &'static str,
    length: Option<InputTarget>,
    seed: &'static [InputTarget],
    steps: &'static [InputTarget],
    cfg: &'static [InputTarget],
    upscale_seed_source: Option<InputTarget>,
}

static T2I: WorkflowRecipe = WorkflowRecipe {
    template: "t2i",
    upscale_variant: true,
    condition_root: "Sampler",
    checkpoint: Some(target("CheckpointLoaderSimple", "ckpt_name")),
    latent: "EmptyLatentImage",
    length: None,
    seed: &[target("KSampler", "seed"), target(UPSCALER, "seed")],
    steps: &[target("KSampler", "steps")],
    cfg: &[target("KSampler", "cfg"), target(UPSCALER, "cfg")],
    upscale_seed_source: Some(target("KSampler", "seed")),
};

static T2I_WAN22: WorkflowRecipe = WorkflowRecipe {
    template: "t2i_wan22",
    upscale_variant: true,
    condition_root: "Sampler",
    checkpoint: None,
    latent: "WanImageToVideo",
    length: None,
    seed: &[target("KSamplerAdvanced", "noise_seed")],
    steps: &[target("KSamplerAdvanced", "steps")],
    cfg: &[target("KSamplerAdvanced", "cfg")],
    upscale_seed_source: Some(target("KSamplerAdvanced", "noise_seed")),
};

static T2V_WAN22: WorkflowRecipe = WorkflowRecipe {
    template: "t2v_wan22",
    upscale_variant: false,
    condition_root: "WanImageToVideo",
    checkpoint: None,
    latent: "WanImageToVideo",
    length: Some(target("WanImageToVideo", "length")),
    seed: &[target("WanMoeKSampler", "seed")],
    steps: &[target("WanMoeKSampler", "steps")],
    cfg: &[
        target("WanMoeKSampler", "cfg_high_noise"),
        target("WanMoeKSampler", "cfg_low_noise"),
    ],
    upscale_seed_source: None,
};

static T2V_WAN22_LITE: WorkflowRecipe = WorkflowRecipe {
    template: "t2v_wan22_lite",
    upscale_variant: false,
    condition_root: "WanImageToVideo",
    checkpoint: None,
    latent: "WanImageToVideo",
    length: Some(target("WanImageToVideo", "length")),
    seed: &[target("KSampler", "seed")],
    steps: &[target("KSampler", "steps")],
    cfg: &[target("KSampler", "cfg")],
    upscale_seed_source: None,
};

static T2I_SDXL_TURBO: WorkflowRecipe = WorkflowRecipe {
    template: "t2i_SDXL_turbo",
    upscale_variant: true,
    condition_root: "Sampler",
    checkpoint: None,
    latent: "EmptySD3LatentImage",
    length: None,
    seed: &[target("SamplerCustom", "noise_seed")],
    steps: &[target("SDTurboScheduler", "steps")],
    cfg: &[target("SamplerCustom", "cfg")],
    upscale_seed_source: Some(target("SamplerCustom", "noise_seed")),
};

/// Values patched into a template. `None` keeps the template's own value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateOverrides {
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub seed: Option<i64>,
    pub step: Option<u32>,
    pub cfg: Option<f64>,
    pub upscale_factor: Option<f64>,
    pub seconds: Option<u32>,
}

impl From<&QueueRequest> for TemplateOverrides {
    fn from(request: &QueueRequest) -> Self {
        Self {
            model: request.model.clone(),
            prompt: Some(request.prompt.clone()),
            negative_prompt: request.negative_prompt.clone(),
            width: request.width,
            height: request.height,
            seed: request.seed,
            step: request.step,
            cfg: request.cfg,
            upscale_factor: request.upscale_factor,
            seconds: request.seconds,
        }
    }
}

impl TemplateOverrides {
    fn upscale(&self) -> Option<f64> {
        self.upscale_factor.filter(|factor| *factor > 1.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowInfo {
    pub name: String,
    pub info: Value,
}

/// The enabled workflows and the directory their templates live in.
#[derive(Debug, Clone)]
pub struct WorkflowCatalog {
    dir: PathBuf,
    entries: BTreeMap<String, (WorkflowKind, Value)>,
}

impl WorkflowCatalog {
    pub fn empty(dir: PathBuf) -> Self {
        Self {
            dir,
            entries: BTreeMap::new(),
        }
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let map_path = dir.join(MODEL_MAP_FILE);
        let raw = fs::read_to_string(&map_path)
            .with_context(|| format!("failed to read workflow map: {}", map_path.display()))?;
        let parsed: Map<String, Value> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse workflow map: {}", map_path.display()))?;

        let mut entries = BTreeMap::new();
        for (name, info) in parsed {
            let kind = name
                .parse::<WorkflowKind>()
                .with_context(|| format!("invalid entry in {}", map_path.display()))?;
            entries.insert(name, (kind, info));
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            entries,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lookup(&self, name: &str) -> Option<WorkflowKind> {
        self.entries.get(name).map(|(kind, _)| *kind)
    }

    pub fn list(&self) -> Vec<WorkflowInfo> {
        self.entries
            .iter()
            .map(|(name, (_, info))| WorkflowInfo {
                name: name.clone(),
                info: info.clone(),
            })
            .collect()
    }

    /// Load and patch the template for `kind`. Failures are logged and yield `None`.
    pub fn resolve(&self, kind: WorkflowKind, overrides: &TemplateOverrides) -> Option<Value> {
        match self.try_resolve(kind, overrides) {
            Ok(workflow) => Some(workflow),
            Err(err) => {
                error!(workflow = %kind, error = %format!("{err:#}"), "Failed to resolve workflow template");
                None
            }
        }
    }

    pub fn try_resolve(&self, kind: WorkflowKind, overrides: &TemplateOverrides) -> Result<Value> {
        let recipe = kind.recipe();
        let path = self.template_path(recipe, overrides.upscale().is_some());
        debug!(workflow = %kind, template = %path.display(), "Loading workflow template");

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read template: {}", path.display()))?;
        let mut workflow: Value = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse template: {}", path.display()))?;
        let graph = workflow
            .as_object_mut()
            .context("template root must be an object of nodes")?;

        apply_overrides(graph, recipe, overrides)?;
        Ok(workflow)
    }

    fn template_path(&self, recipe: &WorkflowRecipe, upscale: bool) -> PathBuf {
        if upscale && recipe.upscale_variant {
            let variant = self
                .dir
                .join(format!("{}{UPSCALE_SUFFIX}.json", recipe.template));
            if variant.exists() {
                return variant;
            }
        }
        self.dir.join(format!("{}.json", recipe.template))
    }
}

fn apply_overrides(
    graph: &mut Map<String, Value>,
    recipe: &WorkflowRecipe,
    overrides: &TemplateOverrides,
) -> Result<()> {
    if let (Some(checkpoint), Some(model)) = (recipe.checkpoint, non_empty(&overrides.model)) {
        set_input(graph, checkpoint, Value::from(model), None);
    }

    if let Some(prompt) = non_empty(&overrides.prompt) {
        let node = conditioning_text_node(graph, "positive", recipe.condition_root)
            .context("no text encoder feeds the positive conditioning")?;
        set_input(graph, target(TEXT_ENCODER, "text"), Value::from(prompt), Some(&node));
    }

    if let Some(negative) = non_empty(&overrides.negative_prompt) {
        let node = conditioning_text_node(graph, "negative", recipe.condition_root)
            .context("no text encoder feeds the negative conditioning")?;
        set_input(graph, target(TEXT_ENCODER, "text"), Value::from(negative), Some(&node));
    }

    if let Some(width) = overrides.width.filter(|w| *w > 5) {
        set_input(graph, target(recipe.latent, "width"), Value::from(width), None);
    }
    if let Some(height) = overrides.height.filter(|h| *h > 5) {
        set_input(graph, target(recipe.latent, "height"), Value::from(height), None);
    }

    if let (Some(length), Some(seconds)) = (recipe.length, overrides.seconds) {
        let frames = FRAMES_PER_SECOND * i64::from(seconds) + 1;
        if frames > 1 {
            set_input(graph, length, Value::from(frames), None);
        }
    }

    if let Some(seed) = overrides.seed.filter(|s| *s != 0) {
        for &t in recipe.seed {
            set_input(graph, t, Value::from(seed), None);
        }
    }
    if let Some(step) = overrides.step.filter(|s| *s != 0) {
        for &t in recipe.steps {
            set_input(graph, t, Value::from(step), None);
        }
    }
    if let Some(cfg) = overrides.cfg.filter(|c| *c != 0.0) {
        for &t in recipe.cfg {
            set_input(graph, t, Value::from(cfg), None);
        }
    }

    if let (Some(factor), true) = (overrides.upscale(), recipe.upscale_variant) {
        apply_upscale(graph, recipe, factor)?;
    }

    Ok(())
}

fn apply_upscale(graph: &mut Map<String, Value>, recipe: &WorkflowRecipe, factor: f64) -> Result<()> {
    set_input(graph, target(UPSCALER, "upscale_by"), Value::from(factor), None);

    if let Some(source) = recipe.upscale_seed_source {
        if let Some(seed) = get_input(graph, source) {
            set_input(graph, target(UPSCALER, "seed"), seed, None);
        }
    }

    let width = get_input(graph, target(recipe.latent, "width"))
        .and_then(|v| v.as_f64())
        .context("template has no latent width for upscale tiling")?;
    let height = get_input(graph, target(recipe.latent, "height"))
        .and_then(|v| v.as_f64())
        .context("template has no latent height for upscale tiling")?;

    let mask_blur = (8.0 * factor).round() as i64;
    let tile_padding = (32.0 * factor).round() as i64;
    let tile_width = (width * factor).floor() as i64 / 2;
    let tile_height = (height * factor).floor() as i64 / 2;

    set_input(graph, target(UPSCALER, "mask_blur"), Value::from(mask_blur), None);
    set_input(graph, target(UPSCALER, "tile_padding"), Value::from(tile_padding), None);
    set_input(graph, target(UPSCALER, "tile_width"), Value::from(tile_width), None);
    set_input(graph, target(UPSCALER, "tile_height"), Value::from(tile_height), None);
    Ok(())
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn node_matches(node: &Value, class_type: &str, key: &str) -> bool {
    let class_matches = node
        .get("class_type")
        .and_then(Value::as_str)
        .is_some_and(|class| class.contains(class_type));
    class_matches
        && node
            .get("inputs")
            .and_then(Value::as_object)
            .is_some_and(|inputs| inputs.contains_key(key))
}

/// Source node id of a link input (`["6", 0]`).
fn link_source(node: &Value, key: &str) -> Option<String> {
    let source = node.get("inputs")?.get(key)?.as_array()?.first()?;
    match source {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Walk the `condition` link upstream from the first `root` node until a text encoder.
fn conditioning_text_node(graph: &Map<String, Value>, condition: &str, root: &str) -> Option<String> {
    let (_, root_node) = graph
        .iter()
        .find(|(_, node)| node_matches(node, root, condition))?;

    let mut current = link_source(root_node, condition)?;
    let mut visited = HashSet::new();
    loop {
        if !visited.insert(current.clone()) {
            return None;
        }
        let node = graph.get(&current)?;
        if node_matches(node, TEXT_ENCODER, "text") {
            return Some(current);
        }
        current = link_source(node, condition)?;
    }
}

fn set_input(graph: &mut Map<String, Value>, t: InputTarget, value: Value, only: Option<&str>) {
    let ids: Vec<String> = match only {
        Some(id) => vec![id.to_string()],
        None => graph.keys().cloned().collect(),
    };

    for id in ids {
        let Some(node) = graph.get_mut(&id) else {
            continue;
        };
        if !node_matches(node, t.class_type, t.key) {
            continue;
        }
        if let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) {
            inputs.insert(t.key.to_string(), value.clone());
        }
    }
}

fn get_input(graph: &Map<String, Value>, t: InputTarget) -> Option<Value> {
    graph
        .values()
        .find(|node| node_matches(node, t.class_type, t.key))
        .and_then(|node| node.get("inputs")?.get(t.key).cloned())
}

/// Reject names that could escape the workflows directory.
pub fn validate_workflow_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        bail!("invalid workflow name '{name}'");
    }
    Ok(())
}
