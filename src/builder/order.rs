//! Resolving orders against the modules on a builder and rendering
//! `/cnb/order.toml`.

use crate::error::{Error, Result};
use crate::module::{ModuleInfo, ModuleKind, ModuleRef, Order, OrderEntry};

/// Pins every ref in `order` to a module in `known`. A ref without a version
/// takes the only version available for its id.
pub fn resolve_order(kind: ModuleKind, known: &[ModuleInfo], order: &[OrderEntry]) -> Result<Order> {
    order
        .iter()
        .map(|entry| {
            let group = entry
                .group
                .iter()
                .map(|module_ref| resolve_ref(kind, known, module_ref))
                .collect::<Result<Vec<_>>>()?;
            Ok(OrderEntry::new(group))
        })
        .collect()
}

fn resolve_ref(kind: ModuleKind, known: &[ModuleInfo], module_ref: &ModuleRef) -> Result<ModuleRef> {
    let mut versions: Vec<&str> = known
        .iter()
        .filter(|info| info.id == module_ref.id)
        .map(|info| info.version.as_str())
        .collect();
    versions.sort_unstable();
    versions.dedup();

    if versions.is_empty() {
        return Err(Error::MissingModule {
            kind: kind.to_string(),
            id: module_ref.id.clone(),
        });
    }

    let mut resolved = module_ref.clone();
    if resolved.version.is_empty() {
        if versions.len() > 1 {
            return Err(Error::AmbiguousVersion {
                id: module_ref.id.clone(),
            });
        }
        resolved.version = versions[0].to_string();
    }

    if !versions.contains(&resolved.version.as_str()) {
        return Err(Error::VersionNotFound {
            kind: kind.to_string(),
            id: resolved.id,
            version: resolved.version,
        });
    }
    Ok(resolved)
}

/// Renders `order.toml` with `order` first and `order-extensions` after it.
/// Extension refs are always written as optional.
pub fn render_order_toml(order: &[OrderEntry], order_extensions: &[OrderEntry]) -> String {
    let mut sections = Vec::new();
    if !order.is_empty() {
        sections.push(render_section("order", order, false));
    }
    if !order_extensions.is_empty() {
        sections.push(render_section("order-extensions", order_extensions, true));
    }
    sections.join("\n")
}

fn render_section(key: &str, order: &[OrderEntry], force_optional: bool) -> String {
    order
        .iter()
        .map(|entry| {
            let mut out = format!("[[{}]]\n", key);
            for module_ref in &entry.group {
                out.push_str(&format!("\n  [[{}.group]]\n", key));
                out.push_str(&format!("    id = {}\n", toml_string(&module_ref.id)));
                if !module_ref.version.is_empty() {
                    out.push_str(&format!("    version = {}\n", toml_string(&module_ref.version)));
                }
                if force_optional || module_ref.optional {
                    out.push_str("    optional = true\n");
                }
            }
            out
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn toml_string(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}
