use color_eyre::{Result, eyre::Context};
use drydock::fs;
use pretty_assertions::assert_eq;

use crate::temporary_directory;

#[test_log::test(tokio::test)]
async fn copy_dir_preserves_nested_tree() -> Result<()> {
    let (_src_guard, src) = temporary_directory();
    let (_dst_guard, dst) = temporary_directory();

    fs::write(&src.join("a.txt"), "alpha").await?;
    fs::write(&src.join("nested/deep/b.txt"), "beta").await?;

    let bytes = fs::copy_dir(&src, &dst).await.context("copy tree")?;
    assert_eq!(bytes, 9, "copied byte total");

    let a = fs::read_to_string(&dst.join("a.txt")).await?;
    let b = fs::read_to_string(&dst.join("nested/deep/b.txt")).await?;
    assert_eq!(a.as_deref(), Some("alpha"));
    assert_eq!(b.as_deref(), Some("beta"));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn copy_dir_recreates_empty_directories() -> Result<()> {
    let (_src_guard, src) = temporary_directory();
    let (_dst_guard, dst) = temporary_directory();

    fs::create_dir_all(&src.join("hollow/inner")).await?;
    fs::write(&src.join("a.txt"), "alpha").await?;

    fs::copy_dir(&src, &dst).await?;

    assert!(fs::is_dir(&dst.join("hollow/inner")).await);
    Ok(())
}

#[cfg(unix)]
#[test_log::test(tokio::test)]
async fn copy_dir_skips_symbolic_links() -> Result<()> {
    let (_src_guard, src) = temporary_directory();
    let (_dst_guard, dst) = temporary_directory();

    fs::write(&src.join("real/file.txt"), "payload").await?;
    tokio::fs::symlink(src.join("real"), src.join("linked"))
        .await
        .context("create symlink")?;

    fs::copy_dir(&src, &dst).await?;

    assert!(fs::is_file(&dst.join("real/file.txt")).await);
    assert!(!fs::exists(&dst.join("linked")).await, "links are not copied");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn dir_size_sums_regular_files() -> Result<()> {
    let (_guard, root) = temporary_directory();

    fs::write(&root.join("one.bin"), vec![0u8; 100]).await?;
    fs::write(&root.join("sub/two.bin"), vec![0u8; 250]).await?;

    assert_eq!(fs::dir_size(&root).await, 350);
    Ok(())
}

#[cfg(unix)]
#[test_log::test(tokio::test)]
async fn dir_size_counts_symlinks_as_zero() -> Result<()> {
    let (_guard, root) = temporary_directory();

    fs::write(&root.join("real/payload.bin"), vec![0u8; 512]).await?;
    tokio::fs::symlink(root.join("real"), root.join("alias"))
        .await
        .context("create symlink")?;

    // The payload is counted once; the aliased view contributes nothing.
    assert_eq!(fs::dir_size(&root).await, 512);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn dir_size_of_missing_directory_is_zero() {
    let (_guard, root) = temporary_directory();
    assert_eq!(fs::dir_size(&root.join("nope")).await, 0);
}

#[test_log::test(tokio::test)]
async fn remove_dir_all_tolerates_missing_directory() -> Result<()> {
    let (_guard, root) = temporary_directory();
    fs::remove_dir_all(&root.join("never-created")).await?;
    Ok(())
}
