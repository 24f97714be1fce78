use std::{
    fs::{self, File},
    io,
    path::Path,
};

use anyhow::Context;

pub fn fsync(path: &Path) -> anyhow::Result<()> {
    File::open(path)
        .context("Failed to open the file")
        .and_then(|file| file.sync_all().context("Failed to sync file metadata"))
        .with_context(|| format!("Failed to fsync file {}", path.display()))
}

pub async fn fsync_async(path: impl AsRef<Path>) -> io::Result<()> {
    tokio::fs::File::open(path.as_ref()).await?.sync_all().await
}

/// Similar to [`std::fs::create_dir_all`], except we fsync all
/// newly created directories and the pre-existing parent.
pub fn create_dir_all(path: impl AsRef<Path>) -> anyhow::Result<()> {
    let mut path = path.as_ref();

    let mut dirs_to_create = Vec::new();

    // Figure out which directories we need to create.
    loop {
        match path.metadata() {
            Ok(metadata) if metadata.is_dir() => break,
            Ok(_) => anyhow::bail!("non-directory found in path: {}", path.display()),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => anyhow::bail!(
                "Error during path {} metadata retrieval: {}",
                path.display(),
                e
            ),
        }

        dirs_to_create.push(path);

        match path.parent() {
            Some(parent) => path = parent,
            None => anyhow::bail!("can't find parent of path '{}'", path.display()),
        }
    }

    for &path in dirs_to_create.iter().rev() {
        fs::create_dir(path)?;
    }

    for &path in dirs_to_create.iter() {
        fsync(path)?;
    }

    if !dirs_to_create.is_empty() {
        fsync(path)?;
    }

    Ok(())
}

/// Rename `old_path` to `new_path` so that after a crash either the old or
/// the new file is observed in full.
///
/// With `do_fsync` the renamed file is synced before the rename and its
/// parent directory after it. Tests pass `false` to skip the syscalls.
pub async fn durable_rename(
    old_path: impl AsRef<Path>,
    new_path: impl AsRef<Path>,
    do_fsync: bool,
) -> io::Result<()> {
    if do_fsync {
        fsync_async(&old_path).await?;
    }

    tokio::fs::rename(old_path, &new_path).await?;

    if do_fsync {
        let parent = match new_path.as_ref().parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fsync_async(parent).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_dir_all_fsyncd() {
        let dir = camino_tempfile::tempdir().unwrap();

        let existing_dir_path = dir.path().as_std_path();
        create_dir_all(existing_dir_path).unwrap();

        let nested_child_dir = existing_dir_path.join("child1").join("child2");
        assert!(!nested_child_dir.exists());
        create_dir_all(&nested_child_dir).unwrap();
        assert!(nested_child_dir.exists());

        let file_path = existing_dir_path.join("file");
        std::fs::write(&file_path, b"").unwrap();

        let err = create_dir_all(&file_path).unwrap_err();
        let error_message = format!("{:#}", err);
        assert!(
            error_message.contains("non-directory found in path"),
            "Unexpected error message: {error_message}"
        );
    }

    #[tokio::test]
    async fn test_durable_rename_replaces_target() {
        let dir = camino_tempfile::tempdir().unwrap();
        let partial = dir.path().join("record.partial");
        let target = dir.path().join("record");

        std::fs::write(&target, b"old").unwrap();
        std::fs::write(&partial, b"new").unwrap();
        durable_rename(&partial, &target, true).await.unwrap();

        assert!(!partial.exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
    }
}
