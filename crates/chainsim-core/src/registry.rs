use crate::definition::{BomDef, ItemDef, ItemKind, ProcessDef, RecipeDef};
use crate::id::{ItemId, MachineId, ProcessId, RecipeId};
use std::collections::BTreeMap;

/// Read-only access to production definitions. A miss is an `Option::None`,
/// which the engine reports as `kb_gap`.
pub trait DefinitionStore: std::fmt::Debug {
    fn get_item(&self, id: &ItemId) -> Option<&ItemDef>;
    fn get_process(&self, id: &ProcessId) -> Option<&ProcessDef>;
    fn get_recipe(&self, id: &RecipeId) -> Option<&RecipeDef>;
    fn get_bom(&self, machine: &MachineId) -> Option<&BomDef>;

    /// The item definition of a machine, if that item is a machine.
    fn get_machine(&self, machine: &MachineId) -> Option<&ItemDef> {
        self.get_item(&ItemId::from(machine))
            .filter(|i| i.kind == ItemKind::Machine)
    }

    /// Items sharing `class`, in id order.
    fn items_in_class(&self, class: &str) -> Vec<&ItemDef>;
}

/// Errors raised while finalizing a registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("definition not found: {0}")]
    NotFound(String),
    #[error("duplicate definition: {0}")]
    Duplicate(String),
    #[error("{owner} references unknown item {item}")]
    InvalidItemRef { owner: String, item: ItemId },
    #[error("recipe {recipe} references unknown process {process}")]
    InvalidProcessRef { recipe: RecipeId, process: ProcessId },
    #[error("bom for {0} does not name a machine item")]
    NotAMachine(MachineId),
}

/// Builder for constructing an immutable Registry.
/// Three-phase lifecycle: registration -> mutation -> finalization.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    items: BTreeMap<ItemId, ItemDef>,
    processes: BTreeMap<ProcessId, ProcessDef>,
    recipes: BTreeMap<RecipeId, RecipeDef>,
    boms: BTreeMap<MachineId, BomDef>,
    duplicates: Vec<String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase 1: Register an item.
    pub fn register_item(&mut self, item: ItemDef) -> &mut Self {
        if self.items.contains_key(&item.id) {
            self.duplicates.push(format!("item {}", item.id));
        }
        self.items.insert(item.id.clone(), item);
        self
    }

    /// Phase 1: Register a process.
    pub fn register_process(&mut self, process: ProcessDef) -> &mut Self {
        if self.processes.contains_key(&process.id) {
            self.duplicates.push(format!("process {}", process.id));
        }
        self.processes.insert(process.id.clone(), process);
        self
    }

    /// Phase 1: Register a recipe.
    pub fn register_recipe(&mut self, recipe: RecipeDef) -> &mut Self {
        if self.recipes.contains_key(&recipe.id) {
            self.duplicates.push(format!("recipe {}", recipe.id));
        }
        self.recipes.insert(recipe.id.clone(), recipe);
        self
    }

    /// Phase 1: Register a bill of materials for a machine.
    pub fn register_bom(&mut self, bom: BomDef) -> &mut Self {
        if self.boms.contains_key(&bom.machine) {
            self.duplicates.push(format!("bom {}", bom.machine));
        }
        self.boms.insert(bom.machine.clone(), bom);
        self
    }

    /// Phase 2: Mutate an existing process by id.
    pub fn mutate_process<F>(&mut self, id: &ProcessId, f: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut ProcessDef),
    {
        let process = self
            .processes
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        f(process);
        Ok(())
    }

    /// Phase 2: Mutate an existing recipe by id.
    pub fn mutate_recipe<F>(&mut self, id: &RecipeId, f: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut RecipeDef),
    {
        let recipe = self
            .recipes
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        f(recipe);
        Ok(())
    }

    pub fn has_item(&self, id: &ItemId) -> bool {
        self.items.contains_key(id)
    }

    /// Phase 3: Finalize and build the immutable registry.
    ///
    /// Cross-references are checked here: every flow names a registered
    /// item, every recipe step a registered process, every BOM a machine.
    pub fn build(self) -> Result<Registry, RegistryError> {
        if let Some(dup) = self.duplicates.first() {
            return Err(RegistryError::Duplicate(dup.clone()));
        }

        for process in self.processes.values() {
            let flows = process.inputs.iter().chain(process.outputs.iter());
            for flow in flows {
                if !self.items.contains_key(&flow.item) {
                    return Err(RegistryError::InvalidItemRef {
                        owner: format!("process {}", process.id),
                        item: flow.item.clone(),
                    });
                }
            }
            for req in &process.machines {
                let as_item = ItemId::from(&req.machine);
                if !self.items.contains_key(&as_item) {
                    return Err(RegistryError::InvalidItemRef {
                        owner: format!("process {}", process.id),
                        item: as_item,
                    });
                }
            }
        }

        for recipe in self.recipes.values() {
            if !self.items.contains_key(&recipe.target_item) {
                return Err(RegistryError::InvalidItemRef {
                    owner: format!("recipe {}", recipe.id),
                    item: recipe.target_item.clone(),
                });
            }
            for step in &recipe.steps {
                if !self.processes.contains_key(&step.process) {
                    return Err(RegistryError::InvalidProcessRef {
                        recipe: recipe.id.clone(),
                        process: step.process.clone(),
                    });
                }
            }
        }

        for bom in self.boms.values() {
            match self.items.get(&ItemId::from(&bom.machine)) {
                Some(item) if item.kind == ItemKind::Machine => {}
                _ => return Err(RegistryError::NotAMachine(bom.machine.clone())),
            }
            for flow in &bom.components {
                if !self.items.contains_key(&flow.item) {
                    return Err(RegistryError::InvalidItemRef {
                        owner: format!("bom {}", bom.machine),
                        item: flow.item.clone(),
                    });
                }
            }
        }

        Ok(Registry {
            items: self.items,
            processes: self.processes,
            recipes: self.recipes,
            boms: self.boms,
        })
    }
}

/// Immutable registry. Frozen after build().
#[derive(Debug, Clone, Default)]
pub struct Registry {
    items: BTreeMap<ItemId, ItemDef>,
    processes: BTreeMap<ProcessId, ProcessDef>,
    recipes: BTreeMap<RecipeId, RecipeDef>,
    boms: BTreeMap<MachineId, BomDef>,
}

impl Registry {
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    pub fn recipe_count(&self) -> usize {
        self.recipes.len()
    }

    pub fn bom_count(&self) -> usize {
        self.boms.len()
    }

    pub fn items(&self) -> impl Iterator<Item = &ItemDef> {
        self.items.values()
    }

    pub fn processes(&self) -> impl Iterator<Item = &ProcessDef> {
        self.processes.values()
    }

    pub fn recipes(&self) -> impl Iterator<Item = &RecipeDef> {
        self.recipes.values()
    }
}

impl DefinitionStore for Registry {
    fn get_item(&self, id: &ItemId) -> Option<&ItemDef> {
        self.items.get(id)
    }

    fn get_process(&self, id: &ProcessId) -> Option<&ProcessDef> {
        self.processes.get(id)
    }

    fn get_recipe(&self, id: &RecipeId) -> Option<&RecipeDef> {
        self.recipes.get(id)
    }

    fn get_bom(&self, machine: &MachineId) -> Option<&BomDef> {
        self.boms.get(machine)
    }

    fn items_in_class(&self, class: &str) -> Vec<&ItemDef> {
        self.items
            .values()
            .filter(|i| i.material_class.as_deref() == Some(class))
            .collect()
    }
}
