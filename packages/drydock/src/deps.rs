//! Dependency extraction from user-submitted JavaScript source.
//!
//! The scan is textual: two regex patterns cover the `require(...)` call and
//! the `import ... from '...'` declaration (including its side-effect-only
//! form). The scan has no awareness of comments or string context, so a
//! commented-out import still produces a dependency; that's a known
//! limitation we tolerate because the worst case is an extra package in the
//! install manifest.

use std::collections::BTreeMap;

use lazy_regex::regex;

/// The version constraint requested for every extracted package.
///
/// Version pins in the source (`require('pkg@1.0.0')`) are ignored; every
/// package installs at `latest`.
pub const LATEST: &str = "latest";

/// Node's built-in modules; these never appear in the dependency set.
const BUILTINS: &[&str] = &[
    "assert",
    "buffer",
    "child_process",
    "cluster",
    "console",
    "constants",
    "crypto",
    "dgram",
    "dns",
    "domain",
    "events",
    "fs",
    "http",
    "https",
    "module",
    "net",
    "os",
    "path",
    "process",
    "punycode",
    "querystring",
    "readline",
    "repl",
    "stream",
    "string_decoder",
    "sys",
    "timers",
    "tls",
    "tty",
    "url",
    "util",
    "v8",
    "vm",
    "zlib",
];

/// Scan source text for third-party package imports.
///
/// Returns the deduplicated set of canonical package names, each mapped to
/// the [`LATEST`] constraint.
pub fn extract_dependencies(source: &str) -> BTreeMap<String, String> {
    let require = regex!(r#"require\s*\(\s*['"]([^'"]+)['"]\s*\)"#);
    let import = regex!(r#"import\s+(?:[\w$*{},\s]+?\s+from\s+)?['"]([^'"]+)['"]"#);

    require
        .captures_iter(source)
        .chain(import.captures_iter(source))
        .filter_map(|caps| caps.get(1))
        .filter_map(|spec| canonical_package_name(spec.as_str()))
        .map(|name| (name, LATEST.to_string()))
        .collect()
}

/// Canonicalise an import specifier into an installable package name.
///
/// - Relative and absolute specifiers are not packages.
/// - `node:`-prefixed specifiers address built-ins directly.
/// - Scoped specifiers keep `@scope/pkg` and drop any pinned version or
///   subpath; unscoped specifiers keep the leading segment up to the first
///   `@` or `/`.
/// - Anything on the built-in list is discarded.
fn canonical_package_name(spec: &str) -> Option<String> {
    if spec.starts_with('.') || spec.starts_with('/') || spec.starts_with("node:") {
        return None;
    }

    let name = if let Some(scoped) = spec.strip_prefix('@') {
        let (scope, tail) = scoped.split_once('/')?;
        let pkg = tail
            .split(['@', '/'])
            .next()
            .filter(|pkg| !pkg.is_empty())?;
        format!("@{scope}/{pkg}")
    } else {
        spec.split(['@', '/'])
            .next()
            .filter(|name| !name.is_empty())?
            .to_string()
    };

    if BUILTINS.contains(&name.as_str()) {
        return None;
    }
    Some(name)
}
