use std::collections::BTreeMap;
use std::path::Path;

use color_eyre::{Result, eyre::Context};
use drydock::{cache::DependencyCache, fs, resolver::Resolver};
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::temporary_directory;

fn deps(names: &[&str]) -> BTreeMap<String, String> {
    names
        .iter()
        .map(|name| (name.to_string(), "latest".to_string()))
        .collect()
}

/// Materialise a fake installed package inside a cache entry.
async fn seed_package(cache_root: &Path, key: &str, name: &str, version: &str) -> Result<()> {
    let manifest = json!({ "name": name, "version": version }).to_string();
    let package = cache_root
        .join(key)
        .join("node_modules")
        .join(name)
        .join("package.json");
    fs::write(&package, manifest).await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn empty_dependency_set_is_a_no_op() -> Result<()> {
    let (_cache_guard, cache_root) = temporary_directory();
    let (_ws_guard, workspace) = temporary_directory();
    let resolver = Resolver::new(DependencyCache::new(&cache_root, 1024 * 1024));

    let report = resolver
        .install(&BTreeMap::new(), &workspace, "t1", false)
        .await
        .expect("install");

    assert!(!report.used_cache);
    assert!(report.installed.is_empty());
    assert!(
        !fs::exists(&workspace.join("node_modules")).await,
        "workspace must not grow a node_modules"
    );
    assert!(
        !fs::exists(&cache_root.join("t1")).await,
        "cache must not be touched"
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn complete_cache_entry_is_reused() -> Result<()> {
    let (_cache_guard, cache_root) = temporary_directory();
    let (_ws_guard, workspace) = temporary_directory();

    seed_package(&cache_root, "t3", "left-pad", "1.3.0").await?;
    let resolver = Resolver::new(DependencyCache::new(&cache_root, 1024 * 1024));

    let report = resolver
        .install(&deps(&["left-pad"]), &workspace, "t3", false)
        .await
        .expect("install");

    assert!(report.used_cache);
    assert_eq!(
        report.installed.get("left-pad").map(String::as_str),
        Some("1.3.0")
    );
    assert!(
        fs::is_dir(&workspace.join("node_modules")).await,
        "dependency tree must be visible in the workspace"
    );
    assert!(
        fs::is_file(&workspace.join("node_modules/left-pad/package.json")).await,
        "packages must resolve through the linked tree"
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn scoped_packages_probe_scope_and_package_directories() -> Result<()> {
    let (_cache_guard, cache_root) = temporary_directory();
    let (_ws_guard, workspace) = temporary_directory();

    seed_package(&cache_root, "t6", "@scope/pkg", "2.0.1").await?;
    let resolver = Resolver::new(DependencyCache::new(&cache_root, 1024 * 1024));

    let report = resolver
        .install(&deps(&["@scope/pkg"]), &workspace, "t6", false)
        .await
        .expect("install");

    assert!(report.used_cache);
    assert_eq!(
        report.installed.get("@scope/pkg").map(String::as_str),
        Some("2.0.1")
    );
    Ok(())
}

/// A cache miss drives the package manager, repopulates the entry, and the
/// next request with the same key reuses the freshly written tree.
///
/// Runs against a real `npm` but stays off the network: the dependency is a
/// local tarball, which npm extracts into `node_modules` like any registry
/// package. Deleting the tarball before the second call proves the reuse
/// path never reinstalls.
#[cfg(unix)]
#[test_log::test(tokio::test)]
async fn fresh_install_repopulates_the_cache() -> Result<()> {
    for tool in ["npm", "tar"] {
        if !crate::tool_available(tool).await {
            eprintln!("skipping: {tool} not available");
            return Ok(());
        }
    }

    let (_fixture_guard, fixture_root) = temporary_directory();
    let manifest = json!({
        "name": "tiny-fixture",
        "version": "0.1.0",
        "main": "index.js",
    });
    fs::write(&fixture_root.join("package/package.json"), manifest.to_string()).await?;
    fs::write(
        &fixture_root.join("package/index.js"),
        "module.exports = () => 'fixture';\n",
    )
    .await?;

    let tarball = fixture_root.join("tiny-fixture-0.1.0.tgz");
    let packed = tokio::process::Command::new("tar")
        .arg("-czf")
        .arg(&tarball)
        .arg("-C")
        .arg(&fixture_root)
        .arg("package")
        .status()
        .await
        .context("pack fixture tarball")?;
    assert!(packed.success(), "tar must pack the fixture");

    let (_cache_guard, cache_root) = temporary_directory();
    let resolver = Resolver::new(DependencyCache::new(&cache_root, 1024 * 1024 * 1024));
    let wanted: BTreeMap<String, String> =
        [("tiny-fixture".to_string(), format!("file:{}", tarball.display()))].into();

    let (_first_guard, first) = temporary_directory();
    let miss = resolver
        .install(&wanted, &first, "s3", false)
        .await
        .expect("fresh install");

    assert!(!miss.used_cache, "first request must miss");
    assert_eq!(
        miss.installed.get("tiny-fixture").map(String::as_str),
        Some("0.1.0")
    );
    assert!(
        fs::is_file(&first.join("node_modules/tiny-fixture/package.json")).await,
        "workspace must hold the installed package"
    );
    assert!(
        fs::is_file(&cache_root.join("s3/node_modules/tiny-fixture/package.json")).await,
        "cache entry must be repopulated from the install"
    );

    // A second install can only succeed through the cache now.
    tokio::fs::remove_file(&tarball).await?;

    let (_second_guard, second) = temporary_directory();
    let hit = resolver
        .install(&wanted, &second, "s3", false)
        .await
        .expect("second install");

    assert!(hit.used_cache, "second request must reuse the entry");
    assert_eq!(miss.installed, hit.installed);
    assert!(fs::is_file(&second.join("node_modules/tiny-fixture/package.json")).await);
    Ok(())
}

/// A second request against the same key reuses the entry the first one saw.
#[test_log::test(tokio::test)]
async fn sequential_requests_share_the_entry() -> Result<()> {
    let (_cache_guard, cache_root) = temporary_directory();

    seed_package(&cache_root, "t3", "left-pad", "1.3.0").await?;
    let resolver = Resolver::new(DependencyCache::new(&cache_root, 1024 * 1024));

    let (_first_guard, first) = temporary_directory();
    let (_second_guard, second) = temporary_directory();

    let one = resolver
        .install(&deps(&["left-pad"]), &first, "t3", false)
        .await
        .expect("first install");
    let two = resolver
        .install(&deps(&["left-pad"]), &second, "t3", false)
        .await
        .expect("second install");

    assert!(one.used_cache);
    assert!(two.used_cache);
    assert_eq!(one.installed, two.installed);
    Ok(())
}
