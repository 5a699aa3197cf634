//! Resolution pipeline: reads data files, resolves them into kernel
//! definitions, builds the registry.
//!
//! Provides format detection (RON/JSON/TOML), file discovery, and
//! deserialization helpers, plus [`load_production_data`] which runs the
//! whole pipeline over a directory.

use crate::schema::*;
use chainsim_core::config::EngineConfig;
use chainsim_core::definition::*;
use chainsim_core::fixed::Fixed64;
use chainsim_core::id::*;
use chainsim_core::registry::{Registry, RegistryBuilder, RegistryError};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// ===========================================================================
// Errors
// ===========================================================================

/// Errors that can occur during data loading.
#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    /// A required data file was not found in the given directory.
    #[error("required file '{file}' not found in {dir}")]
    MissingRequired { file: String, dir: PathBuf },

    /// The file has an extension we don't support.
    #[error("unsupported format for file: {file}")]
    UnsupportedFormat { file: PathBuf },

    /// Two files with the same base name but different formats exist.
    #[error("conflicting formats: {a} and {b}")]
    ConflictingFormats { a: PathBuf, b: PathBuf },

    /// A deserialization error occurred.
    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    /// A number could not be represented, or was out of its allowed range.
    #[error("invalid {field} for '{owner}' in {file}: {detail}")]
    InvalidValue {
        file: PathBuf,
        owner: String,
        field: &'static str,
        detail: String,
    },

    /// A duplicate id was found.
    #[error("duplicate id '{name}' in {file}")]
    DuplicateName { file: PathBuf, name: String },

    /// Cross-references failed when the registry was finalized.
    #[error("definitions do not resolve: {0}")]
    Registry(#[from] RegistryError),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ===========================================================================
// Format detection
// ===========================================================================

/// Supported data file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

/// Detect the format of a file based on its extension.
pub fn detect_format(path: &Path) -> Result<Format, DataLoadError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Ok(Format::Ron),
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        _ => Err(DataLoadError::UnsupportedFormat {
            file: path.to_path_buf(),
        }),
    }
}

// ===========================================================================
// File discovery
// ===========================================================================

/// Scan a directory for a data file with the given base name (without extension).
///
/// Looks for `{base_name}.ron`, `{base_name}.toml`, and `{base_name}.json`.
/// Returns `Ok(None)` if no file is found, or `Err(ConflictingFormats)` if
/// multiple formats exist for the same base name.
pub fn find_data_file(dir: &Path, base_name: &str) -> Result<Option<PathBuf>, DataLoadError> {
    let extensions = ["ron", "toml", "json"];
    let mut found: Option<PathBuf> = None;

    for ext in &extensions {
        let candidate = dir.join(format!("{base_name}.{ext}"));
        if candidate.exists() {
            if let Some(ref existing) = found {
                return Err(DataLoadError::ConflictingFormats {
                    a: existing.clone(),
                    b: candidate,
                });
            }
            found = Some(candidate);
        }
    }

    Ok(found)
}

/// Like [`find_data_file`], but returns an error if no file is found.
pub fn require_data_file(dir: &Path, base_name: &str) -> Result<PathBuf, DataLoadError> {
    find_data_file(dir, base_name)?.ok_or_else(|| DataLoadError::MissingRequired {
        file: base_name.to_string(),
        dir: dir.to_path_buf(),
    })
}

// ===========================================================================
// Deserialization
// ===========================================================================

fn parse_error(path: &Path, e: impl std::fmt::Display) -> DataLoadError {
    DataLoadError::Parse {
        file: path.to_path_buf(),
        detail: e.to_string(),
    }
}

/// Read a file and deserialize it according to its format (detected from extension).
pub fn deserialize_file<T: DeserializeOwned>(path: &Path) -> Result<T, DataLoadError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;

    match format {
        Format::Ron => ron::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Json => serde_json::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Toml => toml::from_str(&content).map_err(|e| parse_error(path, e)),
    }
}

/// Deserialize a list from a file. For TOML files, extracts the array at the
/// given `toml_key` from a top-level table. For RON and JSON, deserializes
/// directly as `Vec<T>`.
pub fn deserialize_list<T: DeserializeOwned>(
    path: &Path,
    toml_key: &str,
) -> Result<Vec<T>, DataLoadError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;

    match format {
        Format::Ron => ron::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Json => serde_json::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Toml => {
            let table: toml::Value = toml::from_str(&content).map_err(|e| parse_error(path, e))?;
            let array = table
                .get(toml_key)
                .ok_or_else(|| DataLoadError::Parse {
                    file: path.to_path_buf(),
                    detail: format!("missing key '{toml_key}' in TOML file"),
                })?
                .clone();
            array
                .try_into()
                .map_err(|e: toml::de::Error| parse_error(path, e))
        }
    }
}

/// Deserialize the list in `{base_name}.*`, or an empty list if the file is absent.
fn optional_list<T: DeserializeOwned>(
    dir: &Path,
    base_name: &str,
) -> Result<(Option<PathBuf>, Vec<T>), DataLoadError> {
    match find_data_file(dir, base_name)? {
        Some(path) => {
            let list = deserialize_list(&path, base_name)?;
            Ok((Some(path), list))
        }
        None => Ok((None, Vec::new())),
    }
}

// ===========================================================================
// Name resolution helpers
// ===========================================================================

/// Check whether a name already exists in a map, returning a `DuplicateName`
/// error if so.
pub fn check_duplicate<V>(
    map: &HashMap<String, V>,
    name: &str,
    file: &Path,
) -> Result<(), DataLoadError> {
    if map.contains_key(name) {
        Err(DataLoadError::DuplicateName {
            file: file.to_path_buf(),
            name: name.to_string(),
        })
    } else {
        Ok(())
    }
}

/// Reject repeated ids within one file.
fn check_unique<'a>(ids: impl Iterator<Item = &'a str>, file: &Path) -> Result<(), DataLoadError> {
    let mut seen = HashMap::new();
    for (i, id) in ids.enumerate() {
        check_duplicate(&seen, id, file)?;
        seen.insert(id.to_string(), i);
    }
    Ok(())
}

// ===========================================================================
// Resolution into kernel definitions
// ===========================================================================

/// Converts file numbers to fixed point, attributing failures to one owner.
struct Resolver<'a> {
    file: &'a Path,
    owner: &'a str,
}

impl Resolver<'_> {
    fn invalid(&self, field: &'static str, detail: impl Into<String>) -> DataLoadError {
        DataLoadError::InvalidValue {
            file: self.file.to_path_buf(),
            owner: self.owner.to_string(),
            field,
            detail: detail.into(),
        }
    }

    fn fixed(&self, field: &'static str, v: f64) -> Result<Fixed64, DataLoadError> {
        if !v.is_finite() {
            return Err(self.invalid(field, format!("{v} is not a finite number")));
        }
        Fixed64::checked_from_num(v).ok_or_else(|| self.invalid(field, format!("{v} is out of range")))
    }

    fn positive(&self, field: &'static str, v: f64) -> Result<Fixed64, DataLoadError> {
        let x = self.fixed(field, v)?;
        if x <= Fixed64::ZERO {
            return Err(self.invalid(field, format!("{v} must be positive")));
        }
        Ok(x)
    }

    fn flow(&self, data: &FlowData) -> Result<Flow, DataLoadError> {
        let (item, qty, unit) = match data {
            FlowData::Short(item, qty, unit) => (item, *qty, unit),
            FlowData::Full { item, qty, unit } => (item, *qty, unit),
        };
        Ok(Flow::new(item.as_str(), self.positive("qty", qty)?, unit.as_str()))
    }

    fn flows(&self, data: &[FlowData]) -> Result<Vec<Flow>, DataLoadError> {
        data.iter().map(|f| self.flow(f)).collect()
    }
}

fn resolve_item(data: &ItemData, file: &Path) -> Result<ItemDef, DataLoadError> {
    let r = Resolver { file, owner: &data.id };
    let kind = match data.kind {
        ItemKindData::RawMaterial => ItemKind::RawMaterial,
        ItemKindData::Material => ItemKind::Material,
        ItemKindData::Part => ItemKind::Part,
        ItemKindData::Product => ItemKind::Product,
        ItemKindData::Machine => ItemKind::Machine,
    };
    Ok(ItemDef {
        id: ItemId::new(data.id.as_str()),
        name: data.name.clone().unwrap_or_else(|| data.id.clone()),
        kind,
        unit: data.unit.clone(),
        material_class: data.material_class.clone(),
        mass_kg_per_unit: data
            .mass_kg_per_unit
            .map(|m| r.positive("mass_kg_per_unit", m))
            .transpose()?,
    })
}

fn resolve_process(data: &ProcessData, file: &Path) -> Result<ProcessDef, DataLoadError> {
    let r = Resolver { file, owner: &data.id };
    let duration = match &data.duration {
        DurationData::Unspecified => DurationModel::Unspecified,
        DurationData::Fixed { hours } => DurationModel::Fixed {
            hours: r.positive("duration", *hours)?,
        },
        DurationData::Batch { hr_per_batch } => DurationModel::Batch {
            hr_per_batch: r.positive("duration", *hr_per_batch)?,
        },
        DurationData::Rate { rate, rate_unit, basis } => DurationModel::Rate {
            rate: r.positive("duration", *rate)?,
            rate_unit: rate_unit.clone(),
            basis: ItemId::new(basis.as_str()),
        },
    };
    let energy = match &data.energy {
        EnergyData::None => EnergyModel::None,
        EnergyData::Fixed { kwh } => EnergyModel::Fixed { kwh: r.fixed("energy", *kwh)? },
        EnergyData::PerBatch { kwh } => EnergyModel::PerBatch { kwh: r.fixed("energy", *kwh)? },
        EnergyData::PerUnit { kwh_per_unit, unit, basis } => EnergyModel::PerUnit {
            kwh_per_unit: r.fixed("energy", *kwh_per_unit)?,
            unit: unit.clone(),
            basis: ItemId::new(basis.as_str()),
        },
    };
    let machines = data
        .machines
        .iter()
        .map(|m| {
            Ok(MachineRequirement {
                machine: MachineId::new(m.machine.as_str()),
                qty: r.positive("machine qty", m.qty)?,
                unit: m.unit.clone(),
            })
        })
        .collect::<Result<Vec<_>, DataLoadError>>()?;

    Ok(ProcessDef {
        id: ProcessId::new(data.id.as_str()),
        name: data.name.clone().unwrap_or_else(|| data.id.clone()),
        inputs: r.flows(&data.inputs)?,
        outputs: r.flows(&data.outputs)?,
        duration,
        energy,
        machines,
    })
}

fn resolve_recipe(data: &RecipeData, file: &Path) -> Result<RecipeDef, DataLoadError> {
    let r = Resolver { file, owner: &data.id };
    let steps = data
        .steps
        .iter()
        .map(|s| {
            Ok(RecipeStep {
                process: ProcessId::new(s.process.as_str()),
                dependencies: s.dependencies.clone(),
                scale: s.scale.map(|v| r.positive("scale", v)).transpose()?,
                duration_hours: s.duration_hours.map(|v| r.positive("duration_hours", v)).transpose()?,
            })
        })
        .collect::<Result<Vec<_>, DataLoadError>>()?;
    Ok(RecipeDef {
        id: RecipeId::new(data.id.as_str()),
        target_item: ItemId::new(data.target_item.as_str()),
        steps,
    })
}

fn resolve_bom(data: &BomData, file: &Path) -> Result<BomDef, DataLoadError> {
    let r = Resolver { file, owner: &data.machine };
    Ok(BomDef {
        machine: MachineId::new(data.machine.as_str()),
        components: r.flows(&data.components)?,
    })
}

// ===========================================================================
// Pipeline
// ===========================================================================

/// Everything needed to construct an engine.
#[derive(Debug, Clone)]
pub struct ProductionData {
    pub registry: Registry,
    pub config: EngineConfig,
}

/// Load an [`EngineConfig`] from a single RON, TOML or JSON file. Missing
/// fields take their defaults.
pub fn load_engine_config(path: &Path) -> Result<EngineConfig, DataLoadError> {
    let config: EngineConfig = deserialize_file(path)?;
    if !config.start_time_hours.is_finite() || config.start_time_hours < 0.0 {
        return Err(DataLoadError::InvalidValue {
            file: path.to_path_buf(),
            owner: config.sim_id.clone(),
            field: "start_time_hours",
            detail: format!("{} must be a non-negative number", config.start_time_hours),
        });
    }
    Ok(config)
}

/// Load `items` and `processes` (required) plus `recipes` and `boms`
/// (optional) from `dir` and build a frozen registry.
pub fn load_definitions(dir: &Path) -> Result<Registry, DataLoadError> {
    let mut builder = RegistryBuilder::new();

    let items_path = require_data_file(dir, "items")?;
    let items: Vec<ItemData> = deserialize_list(&items_path, "items")?;
    check_unique(items.iter().map(|i| i.id.as_str()), &items_path)?;
    for data in &items {
        builder.register_item(resolve_item(data, &items_path)?);
    }
    debug!(file = %items_path.display(), count = items.len(), "items loaded");

    let processes_path = require_data_file(dir, "processes")?;
    let processes: Vec<ProcessData> = deserialize_list(&processes_path, "processes")?;
    check_unique(processes.iter().map(|p| p.id.as_str()), &processes_path)?;
    for data in &processes {
        builder.register_process(resolve_process(data, &processes_path)?);
    }
    debug!(file = %processes_path.display(), count = processes.len(), "processes loaded");

    let (recipes_path, recipes): (_, Vec<RecipeData>) = optional_list(dir, "recipes")?;
    if let Some(path) = &recipes_path {
        check_unique(recipes.iter().map(|r| r.id.as_str()), path)?;
        for data in &recipes {
            builder.register_recipe(resolve_recipe(data, path)?);
        }
        debug!(file = %path.display(), count = recipes.len(), "recipes loaded");
    }

    let (boms_path, boms): (_, Vec<BomData>) = optional_list(dir, "boms")?;
    if let Some(path) = &boms_path {
        check_unique(boms.iter().map(|b| b.machine.as_str()), path)?;
        for data in &boms {
            builder.register_bom(resolve_bom(data, path)?);
        }
        debug!(file = %path.display(), count = boms.len(), "boms loaded");
    }

    let registry = builder.build()?;
    info!(
        dir = %dir.display(),
        items = registry.item_count(),
        processes = registry.process_count(),
        recipes = registry.recipe_count(),
        boms = registry.bom_count(),
        "definitions loaded"
    );
    Ok(registry)
}

/// Load definitions and the optional `engine.*` config from `dir`.
pub fn load_production_data(dir: &Path) -> Result<ProductionData, DataLoadError> {
    let registry = load_definitions(dir)?;
    let config = match find_data_file(dir, "engine")? {
        Some(path) => load_engine_config(&path)?,
        None => EngineConfig::default(),
    };
    Ok(ProductionData { registry, config })
}

// ===========================================================================
// Tests
// ===========================================================================
