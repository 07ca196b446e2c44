// src/pipeline/record.rs
use crate::pipeline::config::ActionOnDuplicateKey;
use crate::pipeline::item::{Item, ItemType, ItemValue};
use crate::pipeline::registry::FieldRegistry;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

static VOID: ItemValue = ItemValue::Void;

/// Per-record side map populated by the record initiator hook.
///
/// The handle is shared: cloning a `TraceBin` (or the record holding it)
/// points at the same entries. Use [`TraceBin::deep_copy`] for an
/// independent copy.
#[derive(Clone, Default)]
pub struct TraceBin {
    entries: Arc<Mutex<IndexMap<String, Value>>>,
}

impl TraceBin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.lock().insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.entries.lock().shift_remove(key)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Current entries, in insertion order
    pub fn snapshot(&self) -> IndexMap<String, Value> {
        self.entries.lock().clone()
    }

    pub fn deep_copy(&self) -> TraceBin {
        TraceBin {
            entries: Arc::new(Mutex::new(self.snapshot())),
        }
    }

    /// True when both handles refer to the same entries
    pub fn shares_with(&self, other: &TraceBin) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }
}

impl fmt::Debug for TraceBin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}

/// One parsed line: uniquely keyed items in their original order
#[derive(Debug, Clone, Default)]
pub struct Record {
    items: IndexMap<String, Item>,
    rec_no: usize,
    source_no: usize,
    clstr_no: usize,
    trace_bin: Option<TraceBin>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number assigned by the parsing stage, starting at 1
    pub fn rec_no(&self) -> usize {
        self.rec_no
    }

    /// Intake source the line came from
    pub fn source_no(&self) -> usize {
        self.source_no
    }

    /// Number of the owning cluster; a parser may pre-assign it, and it is
    /// overwritten when the cluster is finalized
    pub fn clstr_no(&self) -> usize {
        self.clstr_no
    }

    /// Pre-assign a cluster number (used by hierarchical parsers)
    pub fn with_clstr_no(mut self, clstr_no: usize) -> Self {
        self.clstr_no = clstr_no;
        self
    }

    pub fn trace_bin(&self) -> Option<&TraceBin> {
        self.trace_bin.as_ref()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(|k| k.as_str())
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    /// Item at a 0-based position
    pub fn item(&self, index: usize) -> Option<&Item> {
        self.items.get_index(index).map(|(_, item)| item)
    }

    pub fn get_item(&self, key: &str) -> Option<&Item> {
        self.items.get(key)
    }

    /// Value of the item with this key, `Void` when there is no such item
    pub fn get(&self, key: &str) -> &ItemValue {
        self.items.get(key).map(Item::value).unwrap_or(&VOID)
    }

    /// Value at a 0-based position, `Void` past the end
    pub fn value_at(&self, index: usize) -> &ItemValue {
        self.item(index).map(Item::value).unwrap_or(&VOID)
    }

    /// Text form of the item with this key, empty when absent
    pub fn get_str(&self, key: &str) -> &str {
        self.items.get(key).map(Item::string_value).unwrap_or("")
    }

    /// Replace the value of an existing item; returns false when the key is absent
    pub fn set_value(&mut self, key: &str, value: impl Into<ItemValue>) -> bool {
        match self.items.get_mut(key) {
            Some(item) => {
                item.set_value(value.into());
                true
            }
            None => false,
        }
    }

    /// Append an item; returns false (leaving the record unchanged) when the key exists
    pub fn add_item(&mut self, item: Item) -> bool {
        if item.key().is_empty() || self.items.contains_key(item.key()) {
            return false;
        }
        self.items.insert(item.key().to_string(), item);
        true
    }

    pub fn remove_item(&mut self, key: &str) -> Option<Item> {
        self.items.shift_remove(key)
    }

    /// Same keys and numbering with Null values; the TraceBin handle is shared
    pub fn clone_empty(&self) -> Record {
        let items = self
            .items
            .iter()
            .map(|(key, item)| {
                (
                    key.clone(),
                    Item::new(key.clone(), ItemValue::Null, item.def().clone()),
                )
            })
            .collect();
        Record {
            items,
            rec_no: self.rec_no,
            source_no: self.source_no,
            clstr_no: self.clstr_no,
            trace_bin: self.trace_bin.clone(),
        }
    }

    /// Full copy including an independent copy of the TraceBin
    pub fn deep_clone(&self) -> Record {
        let mut copy = self.clone();
        copy.trace_bin = self.trace_bin.as_ref().map(TraceBin::deep_copy);
        copy
    }

    pub(crate) fn set_rec_no(&mut self, rec_no: usize) {
        self.rec_no = rec_no;
    }

    pub(crate) fn set_source_no(&mut self, source_no: usize) {
        self.source_no = source_no;
    }

    pub(crate) fn set_clstr_no(&mut self, clstr_no: usize) {
        self.clstr_no = clstr_no;
    }

    pub(crate) fn set_trace_bin(&mut self, trace_bin: Option<TraceBin>) {
        self.trace_bin = trace_bin;
    }
}

/// Assembles a record from raw key/text pairs, applying the registry's
/// typing and naming rules and the duplicate key policy.
pub struct RecordBuilder<'a> {
    registry: &'a FieldRegistry,
    on_duplicate: ActionOnDuplicateKey,
    items: IndexMap<String, Item>,
    excluded: bool,
}

impl<'a> RecordBuilder<'a> {
    pub fn new(registry: &'a FieldRegistry, on_duplicate: ActionOnDuplicateKey) -> Self {
        RecordBuilder {
            registry,
            on_duplicate,
            items: IndexMap::new(),
            excluded: false,
        }
    }

    /// Add a named field. Names the registry does not accept are dropped;
    /// an empty name gets a default one.
    pub fn add(&mut self, key: &str, text: &str) -> anyhow::Result<()> {
        if self.excluded {
            return Ok(());
        }
        let name = if key.is_empty() {
            let items = &self.items;
            Some(self.registry.next_default_name(|n| items.contains_key(n)))
        } else {
            self.registry.register(key)
        };
        match name {
            Some(name) => self.insert(name, text),
            None => Ok(()),
        }
    }

    /// Add a field by its 1-based position; the registry supplies the name
    pub fn add_positional(&mut self, ordinal: usize, text: &str) -> anyhow::Result<()> {
        if self.excluded {
            return Ok(());
        }
        match self.registry.name_for_position(ordinal) {
            Some(name) => self.insert(name, text),
            None => Ok(()),
        }
    }

    /// Add a named field whose value a self-describing format already typed.
    /// The typed value is kept unless the field has a non-String definition.
    pub fn add_native(&mut self, key: &str, text: &str, native: ItemValue) -> anyhow::Result<()> {
        if self.excluded {
            return Ok(());
        }
        let name = if key.is_empty() {
            let items = &self.items;
            Some(self.registry.next_default_name(|n| items.contains_key(n)))
        } else {
            self.registry.register(key)
        };
        match name {
            Some(name) => self.insert_with(name, text, Some(native)),
            None => Ok(()),
        }
    }

    fn insert(&mut self, name: String, text: &str) -> anyhow::Result<()> {
        self.insert_with(name, text, None)
    }

    fn make_item(&self, name: String, text: &str, native: Option<ItemValue>) -> anyhow::Result<Item> {
        let def = self.registry.item_def(&name)?;
        let item = match native {
            Some(value) if def.item_type == ItemType::String && def.parser.is_none() => {
                Item::with_text(name, value, text, def)
            }
            _ => Item::parse(name, text, def),
        };
        Ok(item)
    }

    fn insert_with(&mut self, name: String, text: &str, native: Option<ItemValue>) -> anyhow::Result<()> {
        if !self.items.contains_key(&name) {
            let item = self.make_item(name.clone(), text, native)?;
            self.items.insert(name, item);
            return Ok(());
        }

        match self.on_duplicate {
            ActionOnDuplicateKey::IgnoreItem => {}
            ActionOnDuplicateKey::ReplaceItem => {
                let item = self.make_item(name.clone(), text, native)?;
                self.items.insert(name, item);
            }
            ActionOnDuplicateKey::AssignDefaultKey => {
                let items = &self.items;
                let fresh = self.registry.next_default_name(|n| items.contains_key(n));
                let item = self.make_item(fresh.clone(), text, native)?;
                self.items.insert(fresh, item);
            }
            ActionOnDuplicateKey::ExcludeRecord => {
                self.excluded = true;
                self.items.clear();
            }
        }
        Ok(())
    }

    pub fn is_excluded(&self) -> bool {
        self.excluded
    }

    /// The finished record, or `None` when the duplicate key policy excluded it
    pub fn build(self) -> Option<Record> {
        if self.excluded {
            return None;
        }
        Some(Record {
            items: self.items,
            ..Record::default()
        })
    }
}
