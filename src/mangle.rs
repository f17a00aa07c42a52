//! Mangled-name handling for builtin calls.
//!
//! Builtin declarations arrive with Itanium-style names of the form
//! `_Z<len><name><params>`. The pass only needs the unqualified name, so the
//! length prefix is parsed and the parameter suffix kept verbatim. Safe twin
//! builtins use a custom scheme that grafts the original parameter suffix
//! onto a `__safe__`-terminated base, which keeps overload selection intact
//! without reimplementing the full mangler.

use crate::error::{ClampError, Result};

/// Marker embedded in the names of memory-safe builtin implementations.
pub const SAFE_DISCRIMINATOR: &str = "__safe__";

/// Returns the demangled function name without its parameter list.
///
/// Non-mangled names are returned unchanged, which also makes the operation
/// idempotent: a demangled name no longer carries the `_Z` prefix.
pub fn demangle(name: &str) -> Result<String> {
    let Some(rest) = name.strip_prefix("_Z") else {
        return Ok(name.to_string());
    };
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return Err(ClampError::UnsupportedConstruct(format!(
            "cannot demangle `{name}`"
        )));
    }
    let len: usize = rest[..digits]
        .parse()
        .map_err(|_| ClampError::UnsupportedConstruct(format!("cannot demangle `{name}`")))?;
    if rest.len() < digits + len {
        return Err(ClampError::UnsupportedConstruct(format!(
            "cannot demangle `{name}`"
        )));
    }
    Ok(rest[digits..digits + len].to_string())
}

/// Builds the name of a safe twin from the original builtin's name.
///
/// The demangled portion of `original` is replaced by `base` (typically
/// `<name>__safe__`) and the Itanium parameter suffix is kept verbatim.
pub fn custom_mangle(original: &str, base: &str) -> Result<String> {
    let demangled = demangle(original)?;
    let pos = original.find(&demangled).ok_or_else(|| {
        ClampError::UnsupportedConstruct(format!("cannot remangle `{original}`"))
    })?;
    let suffix = &original[pos + demangled.len()..];
    Ok(format!("{base}{suffix}"))
}

/// True for functions that implement a memory-safe builtin by hand.
pub fn is_safe_impl_name(name: &str) -> bool {
    name.contains(SAFE_DISCRIMINATOR)
}
