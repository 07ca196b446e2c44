// src/pipeline/registry.rs
use crate::error::ConfigError;
use crate::pipeline::item::{ItemDef, ItemType};
use indexmap::IndexSet;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Supplies the default definition for a field name
pub type TypeDefiner = Arc<dyn Fn(&str) -> anyhow::Result<ItemDef> + Send + Sync>;

/// Default name for the field at a 1-based ordinal: `Fld001`, `Fld002`, ...
pub fn default_field_name(ordinal: usize) -> String {
    format!("Fld{:03}", ordinal)
}

/// Parse `name|Type[|Format]` entries separated by commas
pub fn parse_type_definitions(spec: &str) -> Result<HashMap<String, ItemDef>, ConfigError> {
    let mut defs = HashMap::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.splitn(3, '|');
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(ConfigError::InvalidTypeDefinition {
                spec: entry.to_string(),
                reason: "missing field name".to_string(),
            });
        }
        let item_type = match parts.next() {
            Some(t) => t
                .parse::<ItemType>()
                .map_err(|reason| ConfigError::InvalidTypeDefinition {
                    spec: entry.to_string(),
                    reason,
                })?,
            None => {
                return Err(ConfigError::InvalidTypeDefinition {
                    spec: entry.to_string(),
                    reason: "missing type".to_string(),
                })
            }
        };
        let mut def = ItemDef::new(item_type);
        if let Some(format) = parts.next().filter(|f| !f.is_empty()) {
            def = def.with_format(format);
        }
        defs.insert(name.to_string(), def);
    }
    Ok(defs)
}

/// Field names and their definitions for one pipeline.
///
/// The set of names only grows. Positions are 1-based and follow
/// registration order. Shared between the parsing and output stages.
pub struct FieldRegistry {
    names: RwLock<IndexSet<String>>,
    defs: RwLock<HashMap<String, ItemDef>>,
    explicit: HashMap<String, ItemDef>,
    type_definer: RwLock<Option<TypeDefiner>>,
    allow_on_the_fly: bool,
}

impl fmt::Debug for FieldRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldRegistry")
            .field("names", &*self.names.read())
            .field("explicit", &self.explicit)
            .field("allow_on_the_fly", &self.allow_on_the_fly)
            .finish()
    }
}

impl FieldRegistry {
    pub fn new(allow_on_the_fly: bool) -> Self {
        FieldRegistry {
            names: RwLock::new(IndexSet::new()),
            defs: RwLock::new(HashMap::new()),
            explicit: HashMap::new(),
            type_definer: RwLock::new(None),
            allow_on_the_fly,
        }
    }

    pub fn with_type_definer(self, definer: TypeDefiner) -> Self {
        self.set_type_definer(definer);
        self
    }

    /// Replace the type definer; definitions already handed out are kept
    pub fn set_type_definer(&self, definer: TypeDefiner) {
        *self.type_definer.write() = Some(definer);
    }

    /// Explicit definitions take precedence over the type definer
    pub fn with_explicit_types(mut self, spec: &str) -> Result<Self, ConfigError> {
        self.explicit = parse_type_definitions(spec)?;
        Ok(self)
    }

    pub fn allows_on_the_fly(&self) -> bool {
        self.allow_on_the_fly
    }

    /// Register names unconditionally (configured fields)
    pub fn declare<S: AsRef<str>>(&self, names: &[S]) {
        let mut registered = self.names.write();
        for name in names {
            registered.insert(name.as_ref().to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.read().contains(name)
    }

    /// 1-based position of a registered name
    pub fn ordinal_of(&self, name: &str) -> Option<usize> {
        self.names.read().get_index_of(name).map(|i| i + 1)
    }

    /// Registered names in positional order
    pub fn fields(&self) -> Vec<String> {
        self.names.read().iter().cloned().collect()
    }

    /// Resolve a name found in the data. Known names pass; unknown ones are
    /// registered when on-the-fly fields are allowed and rejected otherwise.
    pub fn register(&self, name: &str) -> Option<String> {
        if self.names.read().contains(name) {
            return Some(name.to_string());
        }
        if !self.allow_on_the_fly {
            return None;
        }
        self.names.write().insert(name.to_string());
        Some(name.to_string())
    }

    /// Name of the field at a 1-based position. Unknown positions get the
    /// default name for that ordinal (or the next free default name if that
    /// one is already taken) when on-the-fly fields are allowed.
    pub fn name_for_position(&self, ordinal: usize) -> Option<String> {
        if ordinal == 0 {
            return None;
        }
        if let Some(name) = self.names.read().get_index(ordinal - 1) {
            return Some(name.clone());
        }
        if !self.allow_on_the_fly {
            return None;
        }

        let mut names = self.names.write();
        // another worker may have extended the registry in between
        if let Some(name) = names.get_index(ordinal - 1) {
            return Some(name.clone());
        }
        let mut candidate = default_field_name(ordinal);
        let mut n = ordinal;
        while names.contains(&candidate) {
            n += 1;
            candidate = default_field_name(n);
        }
        names.insert(candidate.clone());
        Some(candidate)
    }

    /// Map header cells to field names. Blank cells and repeated names fall
    /// back to default names. All resulting names are registered.
    pub fn header_names<S: AsRef<str>>(&self, cells: &[S]) -> Vec<String> {
        let mut names = self.names.write();
        let mut result: Vec<String> = Vec::with_capacity(cells.len());
        for (index, cell) in cells.iter().enumerate() {
            let cell = cell.as_ref().trim();
            let name = if cell.is_empty() || result.iter().any(|n| n == cell) {
                let mut n = index + 1;
                let mut candidate = default_field_name(n);
                while result.contains(&candidate) {
                    n += 1;
                    candidate = default_field_name(n);
                }
                candidate
            } else {
                cell.to_string()
            };
            names.insert(name.clone());
            result.push(name);
        }
        result
    }

    /// Next default name that is neither registered nor rejected by `taken`.
    /// The returned name is registered.
    pub fn next_default_name(&self, taken: impl Fn(&str) -> bool) -> String {
        let mut names = self.names.write();
        let mut n = names.len() + 1;
        loop {
            let candidate = default_field_name(n);
            if !names.contains(&candidate) && !taken(&candidate) {
                names.insert(candidate.clone());
                return candidate;
            }
            n += 1;
        }
    }

    /// Definition for a field: explicit definitions first, then the type
    /// definer, then String.
    pub fn item_def(&self, name: &str) -> anyhow::Result<ItemDef> {
        if let Some(def) = self.explicit.get(name) {
            return Ok(def.clone());
        }
        if let Some(def) = self.defs.read().get(name) {
            return Ok(def.clone());
        }
        let definer = self.type_definer.read().clone();
        let def = match definer {
            Some(definer) => definer(name)?,
            None => ItemDef::default(),
        };
        self.defs.write().insert(name.to_string(), def.clone());
        Ok(def)
    }
}
