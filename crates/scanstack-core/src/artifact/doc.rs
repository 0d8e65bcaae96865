//! `Document` implementations for the structured formats: JSON, YAML, TOML.
//!
//! The three value trees share one navigation routine through the `Node`
//! trait; only container access and conversion differ per format.

use serde_json::Value;
use tracing::debug;

use super::{Document, FieldPath, Segment};
use crate::error::{Result, SynthError};

/// Minimal tree access shared by the three formats.
trait Node: Sized {
    fn new_map() -> Self;
    fn new_seq() -> Self;
    fn is_map(&self) -> bool;
    fn is_seq(&self) -> bool;

    fn map_get(&self, key: &str) -> Option<&Self>;
    fn map_get_mut(&mut self, key: &str) -> Option<&mut Self>;
    fn map_insert(&mut self, key: &str, value: Self);
    fn map_remove(&mut self, key: &str) -> bool;
    fn map_len(&self) -> usize;

    fn seq_len(&self) -> usize;
    fn seq_get(&self, idx: usize) -> Option<&Self>;
    fn seq_get_mut(&mut self, idx: usize) -> Option<&mut Self>;
    fn seq_push(&mut self, value: Self);
    fn seq_remove(&mut self, idx: usize);

    fn as_text(&self) -> Option<String>;
    fn to_json(&self) -> Option<Value>;
    fn from_json(value: &Value) -> Result<Self>;

    fn seq_position(&self, key: &str, value: &str) -> Option<usize> {
        (0..self.seq_len()).find(|i| {
            self.seq_get(*i)
                .and_then(|el| el.map_get(key))
                .and_then(Node::as_text)
                .as_deref()
                == Some(value)
        })
    }
}

fn child<'a, N: Node>(node: &'a N, segment: &Segment) -> Option<&'a N> {
    match segment {
        Segment::Key(key) => node.map_get(key),
        Segment::Index(idx) => node.seq_get(*idx),
        Segment::Match { key, value } => node.seq_position(key, value).and_then(|i| node.seq_get(i)),
    }
}

fn lookup<'a, N: Node>(root: &'a N, path: &FieldPath) -> Option<&'a N> {
    path.segments()
        .iter()
        .try_fold(root, |node, segment| child(node, segment))
}

/// Container a missing step should be created as.
fn container_for<N: Node>(next: Option<&Segment>) -> N {
    match next {
        Some(Segment::Index(_)) | Some(Segment::Match { .. }) => N::new_seq(),
        _ => N::new_map(),
    }
}

/// Walk to `segment`'s child, creating it (and fixing the container type of
/// `node`) where needed.
fn child_or_create<'a, N: Node>(
    node: &'a mut N,
    segment: &Segment,
    next: Option<&Segment>,
) -> Option<&'a mut N> {
    match segment {
        Segment::Key(key) => {
            if !node.is_map() {
                *node = N::new_map();
            }
            if node.map_get(key).is_none() {
                node.map_insert(key, container_for(next));
            }
            node.map_get_mut(key)
        }
        Segment::Index(idx) => {
            if !node.is_seq() {
                *node = N::new_seq();
            }
            while node.seq_len() <= *idx {
                node.seq_push(container_for(next));
            }
            node.seq_get_mut(*idx)
        }
        Segment::Match { key, value } => {
            if !node.is_seq() {
                *node = N::new_seq();
            }
            let idx = match node.seq_position(key, value) {
                Some(idx) => idx,
                None => {
                    let mut entry = N::new_map();
                    entry.map_insert(key, N::from_json(&Value::String(value.clone())).ok()?);
                    node.seq_push(entry);
                    node.seq_len() - 1
                }
            };
            node.seq_get_mut(idx)
        }
    }
}

fn assign<N: Node>(root: &mut N, path: &FieldPath, value: &Value) -> Result<()> {
    let new_value = N::from_json(value)?;
    let segments = path.segments();
    let Some((last, parents)) = segments.split_last() else {
        *root = new_value;
        return Ok(());
    };

    let mut node = root;
    for (i, segment) in parents.iter().enumerate() {
        let next = segments.get(i + 1);
        node = child_or_create(node, segment, next).ok_or_else(|| unreachable_field(path))?;
    }

    let target = child_or_create(node, last, None).ok_or_else(|| unreachable_field(path))?;
    *target = new_value;
    Ok(())
}

fn unreachable_field(path: &FieldPath) -> SynthError {
    SynthError::artifact(path.to_string(), "field could not be created")
}

fn child_mut<'a, N: Node>(node: &'a mut N, segment: &Segment) -> Option<&'a mut N> {
    match segment {
        Segment::Key(key) => node.map_get_mut(key),
        Segment::Index(idx) => node.seq_get_mut(*idx),
        Segment::Match { key, value } => {
            let idx = node.seq_position(key, value)?;
            node.seq_get_mut(idx)
        }
    }
}

fn remove_child<N: Node>(node: &mut N, segment: &Segment) -> bool {
    match segment {
        Segment::Key(key) => node.map_remove(key),
        Segment::Index(idx) if *idx < node.seq_len() => {
            node.seq_remove(*idx);
            true
        }
        Segment::Index(_) => false,
        Segment::Match { key, value } => match node.seq_position(key, value) {
            Some(idx) => {
                node.seq_remove(idx);
                true
            }
            None => false,
        },
    }
}

/// Remove the field at `segments`. Mappings left empty by the removal are
/// removed from their parent mapping as well.
fn delete<N: Node>(node: &mut N, segments: &[Segment]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return false;
    };
    if rest.is_empty() {
        return remove_child(node, first);
    }
    let Some(child) = child_mut(node, first) else {
        return false;
    };
    if !delete(child, rest) {
        return false;
    }
    let emptied = child.is_map() && child.map_len() == 0;
    if emptied && matches!(first, Segment::Key(_)) {
        remove_child(node, first);
    }
    true
}

// ---- JSON ----

impl Node for Value {
    fn new_map() -> Self {
        Value::Object(serde_json::Map::new())
    }
    fn new_seq() -> Self {
        Value::Array(Vec::new())
    }
    fn is_map(&self) -> bool {
        self.is_object()
    }
    fn is_seq(&self) -> bool {
        self.is_array()
    }
    fn map_get(&self, key: &str) -> Option<&Self> {
        self.as_object()?.get(key)
    }
    fn map_get_mut(&mut self, key: &str) -> Option<&mut Self> {
        self.as_object_mut()?.get_mut(key)
    }
    fn map_insert(&mut self, key: &str, value: Self) {
        if let Some(map) = self.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }
    fn map_remove(&mut self, key: &str) -> bool {
        let Some(map) = self.as_object_mut() else {
            return false;
        };
        if !map.contains_key(key) {
            return false;
        }
        // Rebuild so the remaining keys keep their order
        let taken = std::mem::take(map);
        *map = taken.into_iter().filter(|(k, _)| k != key).collect();
        true
    }
    fn map_len(&self) -> usize {
        self.as_object().map(serde_json::Map::len).unwrap_or(0)
    }
    fn seq_len(&self) -> usize {
        self.as_array().map(Vec::len).unwrap_or(0)
    }
    fn seq_get(&self, idx: usize) -> Option<&Self> {
        self.as_array()?.get(idx)
    }
    fn seq_get_mut(&mut self, idx: usize) -> Option<&mut Self> {
        self.as_array_mut()?.get_mut(idx)
    }
    fn seq_push(&mut self, value: Self) {
        if let Some(seq) = self.as_array_mut() {
            seq.push(value);
        }
    }
    fn seq_remove(&mut self, idx: usize) {
        if let Some(seq) = self.as_array_mut() {
            seq.remove(idx);
        }
    }
    fn as_text(&self) -> Option<String> {
        self.as_str().map(str::to_string)
    }
    fn to_json(&self) -> Option<Value> {
        Some(self.clone())
    }
    fn from_json(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

/// JSON document with an object at the top level.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonDoc(pub Value);

impl Document for JsonDoc {
    fn empty() -> Self {
        JsonDoc(Value::new_map())
    }

    fn parse(text: &str) -> std::result::Result<Self, String> {
        let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
        if !value.is_object() {
            return Err("top level is not an object".to_string());
        }
        Ok(JsonDoc(value))
    }

    fn render(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.0)? + "\n")
    }

    fn get(&self, path: &FieldPath) -> Option<Value> {
        lookup(&self.0, path).and_then(Node::to_json)
    }

    fn set(&mut self, path: &FieldPath, value: &Value) -> Result<()> {
        assign(&mut self.0, path, value)
    }

    fn remove(&mut self, path: &FieldPath) -> bool {
        delete(&mut self.0, path.segments())
    }
}

// ---- YAML ----

impl Node for serde_yaml::Value {
    fn new_map() -> Self {
        serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
    }
    fn new_seq() -> Self {
        serde_yaml::Value::Sequence(Vec::new())
    }
    fn is_map(&self) -> bool {
        self.is_mapping()
    }
    fn is_seq(&self) -> bool {
        self.is_sequence()
    }
    fn map_get(&self, key: &str) -> Option<&Self> {
        self.as_mapping()?.get(key)
    }
    fn map_get_mut(&mut self, key: &str) -> Option<&mut Self> {
        self.as_mapping_mut()?.get_mut(key)
    }
    fn map_insert(&mut self, key: &str, value: Self) {
        if let Some(map) = self.as_mapping_mut() {
            map.insert(serde_yaml::Value::String(key.to_string()), value);
        }
    }
    fn map_remove(&mut self, key: &str) -> bool {
        let Some(map) = self.as_mapping_mut() else {
            return false;
        };
        if !map.contains_key(key) {
            return false;
        }
        let taken = std::mem::take(map);
        *map = taken
            .into_iter()
            .filter(|(k, _)| k.as_str() != Some(key))
            .collect();
        true
    }
    fn map_len(&self) -> usize {
        self.as_mapping().map(serde_yaml::Mapping::len).unwrap_or(0)
    }
    fn seq_len(&self) -> usize {
        self.as_sequence().map(Vec::len).unwrap_or(0)
    }
    fn seq_get(&self, idx: usize) -> Option<&Self> {
        self.as_sequence()?.get(idx)
    }
    fn seq_get_mut(&mut self, idx: usize) -> Option<&mut Self> {
        self.as_sequence_mut()?.get_mut(idx)
    }
    fn seq_push(&mut self, value: Self) {
        if let Some(seq) = self.as_sequence_mut() {
            seq.push(value);
        }
    }
    fn seq_remove(&mut self, idx: usize) {
        if let Some(seq) = self.as_sequence_mut() {
            seq.remove(idx);
        }
    }
    fn as_text(&self) -> Option<String> {
        self.as_str().map(str::to_string)
    }
    fn to_json(&self) -> Option<Value> {
        serde_json::to_value(self).ok()
    }
    fn from_json(value: &Value) -> Result<Self> {
        Ok(serde_yaml::to_value(value)?)
    }
}

/// YAML document with a mapping at the top level.
///
/// serde_yaml keeps no comments. The comment block at the top of the file is
/// carried over verbatim; comments further down are lost on render and
/// reported through `drops_comments`.
#[derive(Debug, Clone, PartialEq)]
pub struct YamlDoc {
    value: serde_yaml::Value,
    header: String,
    body_comments: bool,
}

impl YamlDoc {
    pub fn value(&self) -> &serde_yaml::Value {
        &self.value
    }
}

impl Document for YamlDoc {
    fn empty() -> Self {
        YamlDoc {
            value: serde_yaml::Value::new_map(),
            header: String::new(),
            body_comments: false,
        }
    }

    fn parse(text: &str) -> std::result::Result<Self, String> {
        let value: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
        let (header, body) = split_header(text);
        let value = match value {
            // Only comments
            serde_yaml::Value::Null => serde_yaml::Value::new_map(),
            v if v.is_mapping() => v,
            _ => return Err("top level is not a mapping".to_string()),
        };
        Ok(YamlDoc {
            value,
            header: header.to_string(),
            body_comments: has_comment(body),
        })
    }

    fn render(&self) -> Result<String> {
        let mut out = self.header.clone();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&serde_yaml::to_string(&self.value)?);
        Ok(out)
    }

    fn get(&self, path: &FieldPath) -> Option<Value> {
        lookup(&self.value, path).and_then(Node::to_json)
    }

    fn set(&mut self, path: &FieldPath, value: &Value) -> Result<()> {
        assign(&mut self.value, path, value)
    }

    fn remove(&mut self, path: &FieldPath) -> bool {
        delete(&mut self.value, path.segments())
    }

    fn drops_comments(&self) -> bool {
        self.body_comments
    }
}

/// Leading comment and blank lines, and the rest of the text.
fn split_header(text: &str) -> (&str, &str) {
    let mut end = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.starts_with('#') {
            break;
        }
        end += line.len();
    }
    text.split_at(end)
}

/// Whether any line carries a `#` comment outside a quoted scalar.
fn has_comment(text: &str) -> bool {
    text.lines().any(|line| {
        let mut quote: Option<char> = None;
        let mut after_blank = true;
        for c in line.chars() {
            match (quote, c) {
                (None, '#') if after_blank => return true,
                (None, '"' | '\'') if after_blank => quote = Some(c),
                (Some(open), c) if c == open => quote = None,
                _ => {}
            }
            after_blank = c.is_whitespace();
        }
        false
    })
}

// ---- TOML ----

impl Node for toml::Value {
    fn new_map() -> Self {
        toml::Value::Table(toml::Table::new())
    }
    fn new_seq() -> Self {
        toml::Value::Array(Vec::new())
    }
    fn is_map(&self) -> bool {
        self.is_table()
    }
    fn is_seq(&self) -> bool {
        self.is_array()
    }
    fn map_get(&self, key: &str) -> Option<&Self> {
        self.as_table()?.get(key)
    }
    fn map_get_mut(&mut self, key: &str) -> Option<&mut Self> {
        self.as_table_mut()?.get_mut(key)
    }
    fn map_insert(&mut self, key: &str, value: Self) {
        if let Some(table) = self.as_table_mut() {
            table.insert(key.to_string(), value);
        }
    }
    fn map_remove(&mut self, key: &str) -> bool {
        let Some(table) = self.as_table_mut() else {
            return false;
        };
        if !table.contains_key(key) {
            return false;
        }
        let taken = std::mem::take(table);
        *table = taken.into_iter().filter(|(k, _)| k != key).collect();
        true
    }
    fn map_len(&self) -> usize {
        self.as_table().map(toml::Table::len).unwrap_or(0)
    }
    fn seq_len(&self) -> usize {
        self.as_array().map(Vec::len).unwrap_or(0)
    }
    fn seq_get(&self, idx: usize) -> Option<&Self> {
        self.as_array()?.get(idx)
    }
    fn seq_get_mut(&mut self, idx: usize) -> Option<&mut Self> {
        self.as_array_mut()?.get_mut(idx)
    }
    fn seq_push(&mut self, value: Self) {
        if let Some(seq) = self.as_array_mut() {
            seq.push(value);
        }
    }
    fn seq_remove(&mut self, idx: usize) {
        if let Some(seq) = self.as_array_mut() {
            seq.remove(idx);
        }
    }
    fn as_text(&self) -> Option<String> {
        self.as_str().map(str::to_string)
    }
    fn to_json(&self) -> Option<Value> {
        serde_json::to_value(self).ok()
    }
    fn from_json(value: &Value) -> Result<Self> {
        // TOML has no null; generators never ask for one
        toml::Value::try_from(value).map_err(SynthError::from)
    }
}

/// TOML document (always a table at the top level).
///
/// Reads go through `toml::Value`. Every edit is mirrored into a
/// `toml_edit` document so rendering keeps comments and layout. An edit that
/// cannot be mirrored (a path through an array, or a key that changes type)
/// detaches the document, and it renders from the value tree instead.
#[derive(Debug, Clone)]
pub struct TomlDoc {
    value: toml::Value,
    edit: toml_edit::DocumentMut,
    detached: bool,
    comments: bool,
}

impl TomlDoc {
    pub fn value(&self) -> &toml::Value {
        &self.value
    }
}

impl Document for TomlDoc {
    fn empty() -> Self {
        TomlDoc {
            value: toml::Value::new_map(),
            edit: toml_edit::DocumentMut::new(),
            detached: false,
            comments: false,
        }
    }

    fn parse(text: &str) -> std::result::Result<Self, String> {
        let table: toml::Table = toml::from_str(text).map_err(|e| e.to_string())?;
        let edit: toml_edit::DocumentMut = text.parse().map_err(|e: toml_edit::TomlError| e.to_string())?;
        Ok(TomlDoc {
            value: toml::Value::Table(table),
            edit,
            detached: false,
            comments: has_comment(text),
        })
    }

    fn render(&self) -> Result<String> {
        if self.detached {
            let table = self.value.as_table().cloned().unwrap_or_default();
            return Ok(toml::to_string_pretty(&table)?);
        }
        Ok(self.edit.to_string())
    }

    fn get(&self, path: &FieldPath) -> Option<Value> {
        lookup(&self.value, path).and_then(Node::to_json)
    }

    fn set(&mut self, path: &FieldPath, value: &Value) -> Result<()> {
        let converted = <toml::Value as Node>::from_json(value)?;
        assign(&mut self.value, path, value)?;
        if !self.detached && !edit_set(self.edit.as_item_mut(), path, edit_item(&converted)) {
            debug!(field = %path, "TOML edit not mirrored, rendering from values");
            self.detached = true;
        }
        Ok(())
    }

    fn remove(&mut self, path: &FieldPath) -> bool {
        let removed = delete(&mut self.value, path.segments());
        if removed && !self.detached && !edit_remove(self.edit.as_item_mut(), path.segments()) {
            self.detached = true;
        }
        removed
    }

    fn drops_comments(&self) -> bool {
        self.detached && self.comments
    }
}

fn edit_value(value: &toml::Value) -> toml_edit::Value {
    match value {
        toml::Value::String(s) => s.as_str().into(),
        toml::Value::Integer(i) => (*i).into(),
        toml::Value::Float(f) => (*f).into(),
        toml::Value::Boolean(b) => (*b).into(),
        toml::Value::Datetime(d) => {
            let text = d.to_string();
            text.parse::<toml_edit::Value>()
                .unwrap_or_else(|_| text.as_str().into())
        }
        toml::Value::Array(items) => toml_edit::Value::Array(items.iter().map(edit_value).collect()),
        toml::Value::Table(table) => {
            let mut inline = toml_edit::InlineTable::new();
            for (key, value) in table {
                inline.insert(key.as_str(), edit_value(value));
            }
            toml_edit::Value::InlineTable(inline)
        }
    }
}

fn edit_item(value: &toml::Value) -> toml_edit::Item {
    match value {
        toml::Value::Table(table) => {
            let mut out = toml_edit::Table::new();
            for (key, value) in table {
                out.insert(key, edit_item(value));
            }
            toml_edit::Item::Table(out)
        }
        other => toml_edit::Item::Value(edit_value(other)),
    }
}

/// Set `item` at a key-only path of a `toml_edit` tree; `false` when the path
/// cannot be expressed there.
fn edit_set(root: &mut toml_edit::Item, path: &FieldPath, mut item: toml_edit::Item) -> bool {
    let mut keys = Vec::new();
    for segment in path.segments() {
        match segment {
            Segment::Key(key) => keys.push(key.as_str()),
            _ => return false,
        }
    }
    let Some((last, parents)) = keys.split_last() else {
        return false;
    };

    let mut node = root;
    for key in parents {
        let Some(table) = node.as_table_like_mut() else {
            return false;
        };
        if table.get(key).is_none() {
            let mut fresh = toml_edit::Table::new();
            fresh.set_implicit(true);
            table.insert(key, toml_edit::Item::Table(fresh));
        }
        match table.get_mut(key) {
            Some(next) => node = next,
            None => return false,
        }
    }

    let Some(table) = node.as_table_like_mut() else {
        return false;
    };
    // Keep a trailing comment on the replaced value
    if let (Some(toml_edit::Item::Value(old)), toml_edit::Item::Value(new)) = (table.get(last), &mut item) {
        *new.decor_mut() = old.decor().clone();
    }
    table.insert(last, item);
    table.get(last).is_some()
}

/// Mirror of `delete` for a `toml_edit` tree, including the pruning of
/// emptied tables.
fn edit_remove(node: &mut toml_edit::Item, segments: &[Segment]) -> bool {
    let Some((Segment::Key(key), rest)) = segments.split_first() else {
        return false;
    };
    let Some(table) = node.as_table_like_mut() else {
        return false;
    };
    if rest.is_empty() {
        return table.remove(key).is_some();
    }
    let Some(child) = table.get_mut(key) else {
        return false;
    };
    if !edit_remove(child, rest) {
        return false;
    }
    let emptied = child.as_table_like().is_some_and(|t| t.is_empty());
    if emptied {
        table.remove(key);
    }
    true
}
