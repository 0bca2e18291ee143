//! # Operation Registry
//!
//! Maps a canonical trace tag to the constructor that builds the typed
//! [`Operation`]. Built once from the fixed built-in set, optionally extended
//! by configuration before parsing starts, then shared read-only.
//!
//! Tags are canonicalized before lookup: trimmed, `-` becomes `_`, and the
//! case is folded to `Titlecase` (`REGISTER_FILE` and `register-file` both
//! become `Register_file`).

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::TraceError;
use crate::op::{FileMapping, Operation};

/// Builds an operation from the record's fields (tag excluded).
///
/// Returns a human-readable reason on failure; the registry attaches the
/// record position.
pub type Constructor = fn(index: usize, fields: &[&str]) -> Result<Operation, String>;

/// Largest store whose value is written as an integer rather than a byte string.
const MAX_INTEGER_STORE: u64 = 8;

/// Largest single STORE accepted from a trace.
const MAX_STORE_LEN: u64 = 1 << 20;

/// Tag → constructor table.
#[derive(Clone)]
pub struct OperationRegistry {
    constructors: HashMap<String, Constructor>,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl OperationRegistry {
    /// An empty registry. Only markers can be created from it.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// The built-in operation set understood by every trace.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("STORE", build_store);
        registry.register("FLUSH", build_flush);
        registry.register("FENCE", build_fence);
        registry.register("MEMSET", build_memset);
        registry.register("MEMCPY", build_memcpy);
        registry.register("START", build_region_start);
        registry.register("REGION_START", build_region_start);
        registry.register("STOP", build_region_stop);
        registry.register("REGION_STOP", build_region_stop);
        registry.register("REGISTER_FILE", build_register_file);
        registry
    }

    /// Add or replace the constructor for `tag`.
    pub fn register(&mut self, tag: &str, constructor: Constructor) {
        self.constructors.insert(canonical_tag(tag), constructor);
    }

    /// Make `alias` build whatever `target` builds.
    pub fn alias(&mut self, alias: &str, target: &str) -> Result<(), TraceError> {
        let constructor = self
            .constructors
            .get(&canonical_tag(target))
            .copied()
            .ok_or_else(|| TraceError::UnknownAlias {
                alias: alias.to_string(),
                target: target.to_string(),
            })?;
        self.register(alias, constructor);
        Ok(())
    }

    /// Returns `true` if `tag` has a registered constructor.
    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(&canonical_tag(tag))
    }

    /// Build the operation for `tag` from its fields.
    ///
    /// A tag without a constructor becomes a [`Marker`](crate::OpKind::Marker)
    /// when it carries no fields and reads like an annotation; anything else
    /// is an [`UnknownOperation`](TraceError::UnknownOperation).
    pub fn create(
        &self,
        tag: &str,
        fields: &[&str],
        index: usize,
    ) -> Result<Operation, TraceError> {
        match self.constructors.get(&canonical_tag(tag)) {
            Some(constructor) => {
                constructor(index, fields).map_err(|reason| TraceError::malformed(index, reason))
            }
            None if fields.is_empty() && is_marker_text(tag) => {
                Ok(Operation::marker(index, tag.trim()))
            }
            None => Err(TraceError::UnknownOperation {
                record: index,
                tag: tag.trim().to_string(),
            }),
        }
    }

    /// Parse one delimited record: the tag, then tag-specific fields.
    pub fn parse(
        &self,
        record: &str,
        delimiter: char,
        index: usize,
    ) -> Result<Operation, TraceError> {
        let mut parts = record.trim().split(delimiter).map(str::trim);
        let tag = parts.next().unwrap_or_default();
        if tag.is_empty() {
            return Err(TraceError::malformed(index, "empty operation tag"));
        }
        let fields: Vec<&str> = parts.collect();
        self.create(tag, &fields, index)
    }
}

/// Canonical lookup form of a tag: `Titlecase`, `_` separated.
pub fn canonical_tag(tag: &str) -> String {
    let lower = tag.trim().replace('-', "_").to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn is_marker_text(tag: &str) -> bool {
    let tag = tag.trim();
    !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | ':' | ' '))
}

// =============================================================================
// Field parsing
// =============================================================================

/// Parse a `0x`-prefixed hexadecimal or a decimal number.
pub fn parse_number(field: &str) -> Result<u64, String> {
    let field = field.trim();
    let parsed = match field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => field.parse::<u64>(),
    };
    parsed.map_err(|_| format!("invalid number '{}'", field))
}

fn expect_fields(fields: &[&str], names: &[&str]) -> Result<(), String> {
    if fields.len() != names.len() {
        return Err(format!(
            "expected {} field(s) ({}), found {}",
            names.len(),
            names.join(", "),
            fields.len()
        ));
    }
    Ok(())
}

fn decode_hex_bytes(field: &str, len: u64) -> Result<Vec<u8>, String> {
    let hex = field
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let digits = len
        .checked_mul(2)
        .ok_or_else(|| format!("store length {:#x} is too large", len))?;
    if hex.len() as u64 != digits {
        return Err(format!(
            "store of {} bytes needs {} hex digits, found {}",
            len,
            digits,
            hex.len()
        ));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex byte string '{}'", field))
        })
        .collect()
}

fn store_bytes(value: &str, len: u64) -> Result<Vec<u8>, String> {
    if len == 0 {
        return Err("store length must be non-zero".into());
    }
    if len > MAX_STORE_LEN {
        return Err(format!(
            "store length {:#x} exceeds the {:#x}-byte limit",
            len, MAX_STORE_LEN
        ));
    }
    if len <= MAX_INTEGER_STORE {
        let value = parse_number(value)?;
        Ok(value.to_le_bytes()[..len as usize].to_vec())
    } else {
        decode_hex_bytes(value, len)
    }
}

// =============================================================================
// Built-in constructors
// =============================================================================

fn build_store(index: usize, fields: &[&str]) -> Result<Operation, String> {
    expect_fields(fields, &["address", "value", "length"])?;
    let address = parse_number(fields[0])?;
    let len = parse_number(fields[2])?;
    Ok(Operation::store(index, address, store_bytes(fields[1], len)?))
}

fn build_flush(index: usize, fields: &[&str]) -> Result<Operation, String> {
    expect_fields(fields, &["address", "length"])?;
    Ok(Operation::flush(
        index,
        parse_number(fields[0])?,
        parse_number(fields[1])?,
    ))
}

fn build_fence(index: usize, fields: &[&str]) -> Result<Operation, String> {
    expect_fields(fields, &[])?;
    Ok(Operation::fence(index))
}

fn build_memset(index: usize, fields: &[&str]) -> Result<Operation, String> {
    expect_fields(fields, &["address", "byte", "length"])?;
    let fill = parse_number(fields[1])?;
    let fill = u8::try_from(fill).map_err(|_| format!("memset byte {:#x} exceeds 0xff", fill))?;
    Ok(Operation::memset(
        index,
        parse_number(fields[0])?,
        fill,
        parse_number(fields[2])?,
    ))
}

fn build_memcpy(index: usize, fields: &[&str]) -> Result<Operation, String> {
    expect_fields(fields, &["destination", "source", "length"])?;
    Ok(Operation::memcpy(
        index,
        parse_number(fields[0])?,
        parse_number(fields[1])?,
        parse_number(fields[2])?,
    ))
}

fn build_region_start(index: usize, fields: &[&str]) -> Result<Operation, String> {
    expect_fields(fields, &[])?;
    Ok(Operation::region_start(index))
}

fn build_region_stop(index: usize, fields: &[&str]) -> Result<Operation, String> {
    expect_fields(fields, &[])?;
    Ok(Operation::region_stop(index))
}

fn build_register_file(index: usize, fields: &[&str]) -> Result<Operation, String> {
    expect_fields(fields, &["path", "address", "size", "offset"])?;
    if fields[0].is_empty() {
        return Err("register_file needs a path".into());
    }
    Ok(Operation::register_file(
        index,
        FileMapping {
            path: PathBuf::from(fields[0]),
            base: parse_number(fields[1])?,
            size: parse_number(fields[2])?,
            file_offset: parse_number(fields[3])?,
        },
    ))
}
