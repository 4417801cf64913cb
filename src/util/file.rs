use std::{fs, io, path::PathBuf};

/// Total on-disk size of a directory in bytes.
pub fn dir_disk_size(dir_path: &PathBuf) -> u64 {
  fs_extra::dir::get_size(dir_path).unwrap_or(0)
}

/// Copies a directory tree, skipping entries whose names contain any of
/// the `exclude` patterns.
pub fn copy_dir(src: &PathBuf, dst: &PathBuf, exclude: &[&str]) -> io::Result<()> {
  if !dst.is_dir() {
    fs::create_dir_all(dst)?;
  }

  for entry in fs::read_dir(src)? {
    let entry = entry?;
    let name = entry.file_name();
    if exclude
      .iter()
      .any(|pattern| name.to_str().map_or(false, |n| n.contains(pattern)))
    {
      continue;
    }

    let dst_path = dst.join(&name);
    if entry.path().is_dir() {
      copy_dir(&entry.path(), &dst_path, exclude)?;
    } else {
      fs::copy(entry.path(), dst_path)?;
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use tempfile::tempdir;

  use super::*;

  #[test]
  fn test_copy_dir_with_exclusions() {
    let src_dir = tempdir().expect("failed to create temp dir");
    let dst_dir = tempdir().expect("failed to create temp dir");
    let src = src_dir.path().to_path_buf();
    let dst = dst_dir.path().join("copy");

    fs::write(src.join("dat_0"), b"data").unwrap();
    fs::write(src.join("flock"), b"").unwrap();

    copy_dir(&src, &dst, &["flock"]).expect("failed to copy dir");
    assert!(dst.join("dat_0").is_file());
    assert!(!dst.join("flock").exists());
  }

  #[test]
  fn test_dir_disk_size() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let dir = temp_dir.path().to_path_buf();
    fs::write(dir.join("dat_0"), vec![0u8; 1024]).unwrap();
    assert!(dir_disk_size(&dir) >= 1024);
  }
}
