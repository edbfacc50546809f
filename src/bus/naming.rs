// src/bus/naming.rs

/// Joins a controller namespace and a local queue name into the canonical
/// queue name. An empty namespace leaves `local` as a flat queue name.
pub fn resolve(namespace: &str, local: &str, separator: &str) -> String {
    if namespace.is_empty() {
        local.to_string()
    } else {
        format!("{}{}{}", namespace, separator, local)
    }
}
