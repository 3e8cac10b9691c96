use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use touchbridge::{ArenaLayout, BufferSelector, DriverError, EngineConfig, I2cStatus};

/// A scripted run of the engine against the simulated peripheral
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: EngineConfig,
    #[serde(default)]
    pub layout: Layout,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Everything the rx callback should have seen, in order
    #[serde(default)]
    pub packets: Vec<Vec<u8>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    #[default]
    Touch,
    Update,
    Custom(ArenaLayout),
}

impl Layout {
    pub fn arena_layout(&self) -> ArenaLayout {
        match self {
            Layout::Touch => ArenaLayout::TOUCH,
            Layout::Update => ArenaLayout::UPDATE,
            Layout::Custom(layout) => *layout,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub action: Action,
    /// Status flag names the step must fail with; empty means success
    #[serde(default)]
    pub expect: Vec<String>,
}

impl Step {
    pub fn expected(&self) -> Result<I2cStatus> {
        self.expect.iter().try_fold(I2cStatus::empty(), |acc, name| {
            let flag = I2cStatus::from_name(name)
                .with_context(|| format!("unknown status flag `{name}`"))?;
            Ok(acc | flag)
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    StagePacket(Vec<u8>),
    LoadResponse(Vec<u8>),
    SelectBuffer(BufferSelector),
    BusyPolls {
        #[serde(default)]
        after: usize,
        count: usize,
    },
    FailNext(DriverError),
    Stuck(bool),
    AdvanceMs(u32),
    SetAddress(u8),
    EnqueueRead {
        address: u8,
        size: usize,
    },
    EnqueueWrite {
        address: u8,
        data: Vec<u8>,
    },
    Ack {
        address: u8,
        #[serde(default)]
        timeout_ms: u32,
    },
    Process {
        #[serde(default)]
        timeout_ms: u32,
    },
}

pub fn load(path: &Path) -> Result<Scenario> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read {}", path.display()))?;
    let mut scenario: Scenario = serde_json::from_str(&text)
        .with_context(|| format!("Could not parse {}", path.display()))?;
    if scenario.name.is_empty() {
        if let Some(stem) = path.file_stem() {
            scenario.name = stem.to_string_lossy().into_owned();
        }
    }
    for (i, step) in scenario.steps.iter().enumerate() {
        step.expected()
            .with_context(|| format!("{}: step {}", path.display(), i + 1))?;
    }
    Ok(scenario)
}

/// Expands directories into the `.json` files they contain, sorted by name
pub fn collect(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found = Vec::new();
            for entry in std::fs::read_dir(path)
                .with_context(|| format!("Could not list {}", path.display()))?
            {
                let entry = entry?.path();
                if entry.extension().is_some_and(|e| e == "json") {
                    found.push(entry);
                }
            }
            found.sort();
            files.extend(found);
        } else {
            files.push(path.clone());
        }
    }
    Ok(files)
}
